//! Round-robin arbiter behavior.

use raysim_core::common::arbiter::RoundRobinArbiter;

#[test]
fn grant_is_sticky_until_removed() {
    let mut arb = RoundRobinArbiter::new(4);
    arb.add(2);
    assert_eq!(arb.grant(), Some(2));
    assert_eq!(arb.grant(), Some(2));
    arb.remove(2);
    assert_eq!(arb.grant(), None);
}

#[test]
fn priority_advances_past_granted_client() {
    let mut arb = RoundRobinArbiter::new(4);
    arb.add(0);
    arb.add(1);
    assert_eq!(arb.grant(), Some(0));
    arb.remove(0);
    assert_eq!(arb.grant(), Some(1));
    arb.remove(1);

    // After a full rotation, client 0 wins again.
    arb.add(0);
    assert_eq!(arb.grant(), Some(0));
}

#[test]
fn continuous_clients_share_grants_fairly() {
    let mut arb = RoundRobinArbiter::new(3);
    let mut grants = [0u32; 3];
    for i in 0..3 {
        arb.add(i);
    }
    for _ in 0..30 {
        let winner = arb.grant().expect("clients pending");
        grants[winner] += 1;
        arb.remove(winner);
        arb.add(winner);
    }
    // Every continuously pending client receives floor(w / W) grants.
    assert_eq!(grants, [10, 10, 10]);
}

#[test]
fn wraps_around_the_top_client() {
    let mut arb = RoundRobinArbiter::new(3);
    arb.add(2);
    assert_eq!(arb.grant(), Some(2));
    arb.remove(2);
    arb.add(0);
    assert_eq!(arb.grant(), Some(0));
}
