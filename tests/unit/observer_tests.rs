use std::sync::{Arc, Mutex};

use procfleet::observer::{LauncherEvents, ObserverRegistry, SharedEvents};
use procfleet::AppError;

#[derive(Debug, Default)]
struct Tagged;

impl LauncherEvents for Tagged {
    fn kind(&self) -> Option<&str> {
        Some("tagged")
    }
}

fn tagged() -> SharedEvents {
    Arc::new(Mutex::new(Tagged))
}

#[test]
fn registered_kind_is_created() {
    let mut registry = ObserverRegistry::new();
    registry.register("tagged", tagged).unwrap();

    let events = registry.create("tagged").expect("kind is registered");
    assert_eq!(events.lock().unwrap().kind(), Some("tagged"));
}

#[test]
fn unknown_kind_is_a_config_error() {
    let err = ObserverRegistry::new()
        .create("metrics")
        .err().expect("nothing registered");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("metrics")));
}

#[test]
fn duplicate_kind_is_rejected() {
    let mut registry = ObserverRegistry::new();
    registry.register("tagged", tagged).unwrap();
    assert!(registry.register("tagged", tagged).is_err());
}

#[test]
fn default_callbacks_are_no_ops() {
    #[derive(Default)]
    struct Silent;
    impl LauncherEvents for Silent {}

    let silent = Silent;
    assert_eq!(silent.kind(), None);
}
