//! Each conformance scenario as its own test.

fn run(name: &str) {
    let scenario = ldm7_sim::all()
        .into_iter()
        .find(|s| s.name == name)
        .unwrap_or_else(|| panic!("unknown scenario {name}"));
    if let Err(why) = (scenario.run)() {
        panic!("{name}: {why}");
    }
}

#[test]
fn single_product_round_trip() {
    run("single-product-round-trip");
}

#[test]
fn loss_and_backstop() {
    run("loss-and-backstop");
}

#[test]
fn restart_with_backlog() {
    run("restart-with-backlog");
}

#[test]
fn eviction() {
    run("eviction");
}

#[test]
fn frame_assembler_loss() {
    run("frame-assembler-loss");
}

#[test]
fn duplicate_delivery_noop() {
    run("duplicate-delivery-noop");
}
