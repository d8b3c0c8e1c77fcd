// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::json;

use crate::rpc::RpcId;

use super::{RegistryError, RequestOutcome, RequestRegistry};

#[tokio::test]
async fn agent_reply_reaches_the_waiting_client() -> anyhow::Result<()> {
    let registry = RequestRegistry::new();
    let (bridge_id, rx) = registry.register_client_wait("s1", 10);

    assert!(registry.resolve(&RpcId::from(bridge_id), Ok(json!({"stopReason": "end_turn"}))));

    let outcome = rx.await?;
    let RequestOutcome::Reply(Ok(value)) = outcome else {
        anyhow::bail!("expected reply, got {outcome:?}");
    };
    assert_eq!(value["stopReason"], "end_turn");
    Ok(())
}

#[tokio::test]
async fn bridge_ids_are_unique_across_waits() {
    let registry = RequestRegistry::new();
    let (a, _rx_a) = registry.register_client_wait("s1", 1);
    let (b, _rx_b) = registry.register_client_wait("s2", 2);
    let (c, _rx_c) = registry.register_handshake_wait("s1");
    assert_ne!(a, b);
    assert_ne!(b, c);
    assert_ne!(a, c);
}

#[tokio::test]
async fn resolve_ignores_unknown_and_non_numeric_ids() {
    let registry = RequestRegistry::new();
    assert!(!registry.resolve(&RpcId::Num(999), Ok(json!({}))));
    assert!(!registry.resolve(&RpcId::Str("abc".to_owned()), Ok(json!({}))));
}

#[tokio::test]
async fn fail_session_unblocks_all_waiters_and_returns_agent_requests() -> anyhow::Result<()> {
    let registry = RequestRegistry::new();
    let (_, client_rx) = registry.register_client_wait("s1", 1);
    let (_, handshake_rx) = registry.register_handshake_wait("s1");
    let (_, mut other_rx) = registry.register_client_wait("s2", 2);
    registry.add_agent_request("s1", RpcId::Num(5), "session/request_permission");

    let parked = registry.fail_session("s1", RegistryError::SessionTerminated);
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].id, RpcId::Num(5));

    for rx in [client_rx, handshake_rx] {
        let outcome = rx.await?;
        assert!(matches!(
            outcome,
            RequestOutcome::Failed(RegistryError::SessionTerminated)
        ));
    }

    // The other session's wait is untouched.
    assert!(other_rx.try_recv().is_err());
    assert_eq!(registry.agent_request_count("s1"), 0);
    Ok(())
}

#[tokio::test]
async fn fail_client_only_touches_that_client() -> anyhow::Result<()> {
    let registry = RequestRegistry::new();
    let (_, gone_rx) = registry.register_client_wait("s1", 7);
    let (_, mut kept_rx) = registry.register_client_wait("s1", 8);

    registry.fail_client(7);

    let outcome = gone_rx.await?;
    assert!(matches!(outcome, RequestOutcome::Failed(RegistryError::ClientGone)));
    assert!(kept_rx.try_recv().is_err());
    Ok(())
}

#[test]
fn agent_request_take_prefers_exact_then_loose_match() {
    let registry = RequestRegistry::new();
    registry.add_agent_request("s1", RpcId::Num(42), "session/request_permission");
    registry.add_agent_request("s1", RpcId::Str("42".to_owned()), "session/request_permission");

    // Exact string match takes the string entry, leaving the number parked.
    let taken = registry.take_agent_request("s1", &RpcId::Str("42".to_owned()));
    assert_eq!(taken.map(|r| r.id), Some(RpcId::Str("42".to_owned())));
    assert_eq!(registry.agent_request_count("s1"), 1);

    // A numeric-looking string now coerces onto the numeric entry.
    let taken = registry.take_agent_request("s1", &RpcId::Str("42".to_owned()));
    assert_eq!(taken.map(|r| r.id), Some(RpcId::Num(42)));
}

#[test]
fn taking_twice_finds_nothing() {
    let registry = RequestRegistry::new();
    registry.add_agent_request("s1", RpcId::Num(1), "session/request_permission");

    assert!(registry.take_agent_request("s1", &RpcId::Num(1)).is_some());
    assert!(registry.take_agent_request("s1", &RpcId::Num(1)).is_none());
}

#[test]
fn raw_reply_lookup_scans_sessions() -> anyhow::Result<()> {
    let registry = RequestRegistry::new();
    registry.add_agent_request("s1", RpcId::Num(3), "session/request_permission");
    registry.add_agent_request("s2", RpcId::Num(4), "session/request_permission");

    let (session, request) = registry
        .take_agent_request_any_session(&RpcId::Num(4))
        .ok_or_else(|| anyhow::anyhow!("expected a parked request"))?;
    assert_eq!(session, "s2");
    assert_eq!(request.id, RpcId::Num(4));
    assert!(registry.take_agent_request_any_session(&RpcId::Num(4)).is_none());
    Ok(())
}

#[tokio::test]
async fn discard_makes_late_replies_a_no_op() {
    let registry = RequestRegistry::new();
    let (bridge_id, _rx) = registry.register_client_wait("s1", 1);

    registry.discard(bridge_id);
    assert!(!registry.resolve(&RpcId::from(bridge_id), Ok(json!({}))));
}
