#[test]
fn init_logging_is_idempotent() {
    espvpn_core::init_logging();
    espvpn_core::init_logging();
    log::info!("still logging");
}
