//! Ownership properties across a cluster of partitioners sharing one view.

use proptest::prelude::*;
use sgw_eventing::partition::{MembershipView, TokenPartitioner};
use sgw_events::TokenSpace;

fn members(count: usize) -> Vec<(String, String)> {
    (0..count)
        .map(|i| (format!("node-{i}"), format!("http://node-{i}.invalid")))
        .collect()
}

fn cluster(version: u64, space: TokenSpace, count: usize) -> Vec<TokenPartitioner> {
    let members = members(count);
    let view = MembershipView::even(version, space, &members).unwrap();
    members
        .iter()
        .map(|(id, _)| TokenPartitioner::new(id.as_str(), view.clone()))
        .collect()
}

proptest! {
    #[test]
    fn every_token_has_exactly_one_local_owner(size in 1u32..512, count in 1usize..12) {
        let space = TokenSpace::new(size);
        let nodes = cluster(1, space, count);

        for token in 0..size {
            let owners = nodes.iter().filter(|p| p.owns(token)).count();
            prop_assert_eq!(owners, 1, "token {} owned {} times", token, owners);

            // Every node names the same owner.
            let named: Vec<String> =
                nodes.iter().map(|p| p.owner_of(token).unwrap().node_id).collect();
            prop_assert!(named.windows(2).all(|w| w[0] == w[1]));
        }
    }

    #[test]
    fn routing_keys_land_on_one_owner(
        keys in proptest::collection::vec("[a-z0-9/]{1,24}", 1..32),
        count in 1usize..6,
    ) {
        let space = TokenSpace::new(100);
        let nodes = cluster(1, space, count);

        for key in &keys {
            let token = space.token_for(key);
            prop_assert!(token < space.size());
            prop_assert_eq!(nodes.iter().filter(|p| p.owns(token)).count(), 1);
        }
    }

    #[test]
    fn rebalance_keeps_single_ownership(
        size in 8u32..256,
        before in 1usize..6,
        after in 1usize..6,
    ) {
        let space = TokenSpace::new(size);
        let initial = MembershipView::even(1, space, &members(before)).unwrap();
        // Nodes outside the active membership own nothing.
        let nodes: Vec<TokenPartitioner> = members(before.max(after))
            .iter()
            .map(|(id, _)| TokenPartitioner::new(id.as_str(), initial.clone()))
            .collect();

        let next = MembershipView::even(2, space, &members(after)).unwrap();
        for node in &nodes {
            prop_assert!(node.apply(next.clone()).unwrap());
        }

        for token in 0..size {
            prop_assert_eq!(nodes.iter().filter(|p| p.owns(token)).count(), 1);
        }
    }
}

#[test]
fn stale_view_does_not_move_ownership() {
    let space = TokenSpace::new(100);
    let nodes = cluster(5, space, 2);
    let owner_before = nodes[0].owner_of(10).unwrap();

    let stale = MembershipView::single_node(4, space, "node-1", "http://node-1.invalid");
    assert!(!nodes[0].apply(stale).unwrap());
    assert_eq!(nodes[0].owner_of(10).unwrap(), owner_before);
}
