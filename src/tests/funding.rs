use std::sync::Arc;

use super::mock::{Call, MockBackend, Script};
use crate::backend::{BackendKind, FundingStepResponse};
use crate::config;
use crate::errors::{ChannelError, FundingStep};
use crate::funding::*;

fn batch_request() -> FundingRequest {
    FundingRequest {
        node_pubkey: "02aa".into(),
        host: Some("10.0.0.1:9735".into()),
        local_funding_amount_sat: 100_000,
        sat_per_vbyte: Some(2),
        additional_channels: vec![
            AdditionalChannel {
                pubkey: "02bb".into(),
                host: None,
                sat_amount: 50_000,
            },
            AdditionalChannel {
                pubkey: "02cc".into(),
                host: Some("10.0.0.3:9735".into()),
                sat_amount: 20_000,
            },
        ],
        ..Default::default()
    }
}

fn machine(script: Script) -> (Arc<MockBackend>, FundingStateMachine<MockBackend>) {
    let backend = Arc::new(MockBackend::new(BackendKind::Lnd, script));
    let machine = FundingStateMachine::new(backend.clone(), config::Funding::default());
    (backend, machine)
}

fn verify_flags(calls: &[Call]) -> Vec<bool> {
    calls
        .iter()
        .filter_map(|c| match c {
            Call::PsbtVerify { skip_finalize, .. } => Some(*skip_finalize),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn batch_chains_psbts_and_finalizes_last() {
    let (backend, mut machine) = machine(Script::default());
    let states = machine.subscribe();

    let outcome = machine.open(batch_request()).await.unwrap();
    assert_eq!(
        outcome,
        FundingOutcome::Published {
            txid: Some("f00d".into())
        }
    );

    let calls = backend.calls();
    assert_eq!(verify_flags(&calls), vec![true, true, false]);

    let s0 = "signed(bc1q02aa:100000)".to_string();
    let s1 = format!("signed({}+bc1q02bb:50000)", s0);
    let s2 = format!("signed({}+bc1q02cc:20000)", s1);
    let opens: Vec<_> = calls
        .iter()
        .filter_map(|c| match c {
            Call::OpenChannelPsbt {
                base_psbt,
                no_publish,
                ..
            } => Some((base_psbt.clone(), *no_publish)),
            _ => None,
        })
        .collect();
    assert_eq!(
        opens,
        vec![
            (None, true),
            (Some(s0.clone()), true),
            (Some(s1.clone()), false)
        ]
    );
    assert_eq!(calls.last(), Some(&Call::PsbtFinalize { psbt: s2 }));
    assert_eq!(
        backend.count(|c| matches!(c, Call::ConnectPeer(_))),
        2,
        "only peers with a host are connected"
    );

    assert!(machine.request().is_none());
    assert!(machine.pending_chan_ids().is_empty());
    assert_eq!(
        *states.borrow(),
        FundingState::Published {
            txid: Some("f00d".into())
        }
    );
}

#[tokio::test]
async fn failure_stops_the_batch() {
    let mut script = Script::default();
    script
        .failures
        .insert("psbt_verify", (Some(1), "psbt does not match".into()));
    let (backend, mut machine) = machine(script);

    match machine.open(batch_request()).await {
        Err(ChannelError::BatchFailed { step, source }) => {
            assert_eq!(step, FundingStep::PsbtVerified(1));
            assert_eq!(source.raw(), Some("psbt does not match"));
        }
        other => panic!("unexpected {:?}", other),
    }

    let calls = backend.calls();
    assert_eq!(verify_flags(&calls), vec![true, true]);
    assert!(!calls.iter().any(|c| matches!(c, Call::PsbtFinalize { .. })));
    assert!(!calls
        .iter()
        .any(|c| matches!(c, Call::OpenChannelPsbt { pubkey, .. } if pubkey == "02cc")));
    assert!(!calls.contains(&Call::ConnectPeer("02cc".into())));

    assert!(machine.request().is_none());
    assert!(machine.pending_chan_ids().is_empty());
    assert_eq!(
        machine.last_signed_psbt(),
        Some("signed(signed(bc1q02aa:100000)+bc1q02bb:50000)")
    );
    match machine.state() {
        FundingState::Failed { step, .. } => assert_eq!(step, FundingStep::PsbtVerified(1)),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn connect_failure_aborts_before_funding() {
    let mut script = Script::default();
    script
        .failures
        .insert("connect_peer", (None, "dial tcp: connection refused".into()));
    let (backend, mut machine) = machine(script);

    match machine.open(batch_request()).await {
        Err(ChannelError::BatchFailed { step, .. }) => {
            assert_eq!(step, FundingStep::PeerConnect(0))
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(backend.calls(), vec![Call::ConnectPeer("02aa".into())]);
}

#[tokio::test]
async fn direct_open_treats_already_connected_as_success() {
    let mut script = Script::default();
    script.failures.insert(
        "connect_peer",
        (None, "already connected to peer: 02aa".into()),
    );
    let (backend, mut machine) = machine(script);

    let request = FundingRequest {
        node_pubkey: "02aa".into(),
        host: Some("10.0.0.1:9735".into()),
        local_funding_amount_sat: 100_000,
        ..Default::default()
    };
    assert!(machine.is_direct(&request));
    match machine.open(request).await.unwrap() {
        FundingOutcome::Opened(point) => assert_eq!(point.txid, "0pen"),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(
        backend.calls(),
        vec![
            Call::ConnectPeer("02aa".into()),
            Call::OpenChannelSync("02aa".into())
        ]
    );
}

#[tokio::test]
async fn other_account_uses_psbt_flow_for_single_channel() {
    let (backend, mut machine) = machine(Script::default());
    let request = FundingRequest {
        node_pubkey: "02aa".into(),
        local_funding_amount_sat: 100_000,
        account: Some("cold".into()),
        ..Default::default()
    };
    assert!(!machine.is_direct(&request));
    machine.open(request).await.unwrap();

    let calls = backend.calls();
    assert_eq!(verify_flags(&calls), vec![false]);
    assert_eq!(
        calls[0],
        Call::OpenChannelPsbt {
            pubkey: "02aa".into(),
            base_psbt: None,
            no_publish: false
        }
    );
}

#[tokio::test]
async fn publish_error_fails_the_attempt() {
    let mut script = Script::default();
    script.finalize_response = FundingStepResponse {
        publish_error: Some("min relay fee not met".into()),
        txid: None,
    };
    let (_backend, mut machine) = machine(script);

    match machine.open(batch_request()).await {
        Err(ChannelError::BatchFailed { step, source }) => {
            assert_eq!(step, FundingStep::PsbtFinalized);
            assert!(matches!(*source, ChannelError::PublishFailed(_)));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(machine.last_signed_psbt().is_some());
}

#[tokio::test]
async fn invalid_request_issues_no_calls() {
    let (backend, mut machine) = machine(Script::default());
    let mut request = batch_request();
    request.additional_channels[0].sat_amount = 0;
    match machine.open(request).await {
        Err(ChannelError::InvalidFundingRequest(_)) => {}
        other => panic!("unexpected {:?}", other),
    }
    assert!(backend.calls().is_empty());
}
