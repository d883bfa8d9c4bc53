fn main() {
    if let Err(err) = battle_plan_lib::run() {
        eprintln!("battle-plan: {err}");
        std::process::exit(1);
    }
}
