mod common;

use std::sync::{Arc, Mutex};

use metered_gateway::{
    balance::TxKind,
    credentials::KeyPolicy,
    error::GatewayError,
    metering::{CallOutcome, CallPhase, MeteredCall},
    owners::NewOwner,
    usage::{Page, TokenUsage},
};

use common::Harness;

const NO_UPSTREAM: &str = "http://127.0.0.1:9";

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[tokio::test]
async fn overdraft_is_rejected_and_leaves_no_trace() {
    let gw = Harness::start(NO_UPSTREAM, &[]).await;
    let owner = gw.state.owners.create(NewOwner::named("alice")).await.unwrap();
    let ledger = &gw.state.balance;

    ledger.recharge(owner.id, 10.0, Some("order-1"), None).await.unwrap();
    let err = ledger
        .consume(owner.id, 20.0, None, None, false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::InsufficientBalance { balance, required } if close(balance, 10.0) && close(required, 20.0)
    ));

    assert!(close(ledger.balance(owner.id).await.unwrap(), 10.0));
    let entries = ledger
        .transactions(owner.id, None, Page::default())
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, TxKind::Recharge);
    assert_eq!(entries[0].order_no.as_deref(), Some("order-1"));
}

#[tokio::test]
async fn discounted_consumption_sums_exactly() {
    let gw = Harness::start(NO_UPSTREAM, &[]).await;
    let owner = gw.state.owners.create(NewOwner::named("bob")).await.unwrap();
    let ledger = &gw.state.balance;

    ledger.recharge(owner.id, 10.0, None, None).await.unwrap();
    ledger.set_discount(owner.id, 0.8).await.unwrap();
    for _ in 0..10 {
        ledger.consume(owner.id, 1.0, None, None, true).await.unwrap();
    }

    let consumes = ledger
        .transactions(owner.id, Some(TxKind::Consume), Page::default())
        .await
        .unwrap();
    assert_eq!(consumes.len(), 10);
    let total: f64 = consumes.iter().map(|t| t.amount).sum();
    assert!(close(total, -8.0));

    let stats = ledger.stats(owner.id).await.unwrap();
    assert!(close(stats.balance, 2.0));
    assert!(close(stats.total_recharged, 10.0));
    assert!(close(stats.total_consumed, 8.0));
    assert_eq!(stats.discount_percent, 20);
}

#[tokio::test]
async fn ledger_replays_to_the_stored_balance() {
    let gw = Harness::start(NO_UPSTREAM, &[]).await;
    let owner = gw.state.owners.create(NewOwner::named("carol")).await.unwrap();
    let ledger = &gw.state.balance;

    ledger.recharge(owner.id, 5.0, Some("o-1"), None).await.unwrap();
    ledger.consume(owner.id, 1.25, Some(7), Some("chat"), false).await.unwrap();
    ledger.refund(owner.id, 0.25, Some("o-1"), Some("partial")).await.unwrap();
    ledger.adjust(owner.id, -1.0, Some("correction")).await.unwrap();
    let change = ledger.adjust(owner.id, 0.5, None).await.unwrap();
    assert!(close(change.balance, 3.5));
    assert_eq!(change.transaction.kind, TxKind::Adjust);
    assert!(close(change.transaction.balance_before, 3.0));

    let audit = ledger.audit(owner.id).await.unwrap();
    assert_eq!(audit.entries, 5);
    assert!(audit.chain_intact);
    assert!(audit.entries_balanced);
    assert!(audit.is_consistent());

    // Newest first.
    let entries = ledger.transactions(owner.id, None, Page::default()).await.unwrap();
    assert_eq!(entries.first().map(|t| t.kind), Some(TxKind::Adjust));
    assert_eq!(entries.last().map(|t| t.kind), Some(TxKind::Recharge));
}

#[tokio::test]
async fn invalid_amounts_and_unknown_owners_are_refused() {
    let gw = Harness::start(NO_UPSTREAM, &[]).await;
    let owner = gw.state.owners.create(NewOwner::named("dave")).await.unwrap();
    let ledger = &gw.state.balance;

    assert!(matches!(
        ledger.recharge(owner.id, -1.0, None, None).await,
        Err(GatewayError::InvalidAmount(_))
    ));
    assert!(matches!(
        ledger.consume(owner.id, f64::NAN, None, None, false).await,
        Err(GatewayError::InvalidAmount(_))
    ));
    assert!(matches!(
        ledger.set_discount(owner.id, 1.5).await,
        Err(GatewayError::InvalidAmount(_))
    ));
    assert!(matches!(
        ledger.recharge(owner.id + 100, 1.0, None, None).await,
        Err(GatewayError::NotFound(_))
    ));
    assert!(ledger.transactions(owner.id, None, Page::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn check_reports_affordability_after_discount() {
    let gw = Harness::start(NO_UPSTREAM, &[]).await;
    let owner = gw.state.owners.create(NewOwner::named("erin")).await.unwrap();
    let ledger = &gw.state.balance;

    ledger.recharge(owner.id, 1.0, None, None).await.unwrap();
    ledger.set_discount(owner.id, 0.5).await.unwrap();
    let (ok, balance) = ledger.check(owner.id, 2.0).await.unwrap();
    assert!(ok);
    assert!(close(balance, 1.0));
    let (ok, _) = ledger.check(owner.id, 2.5).await.unwrap();
    assert!(!ok);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_consumes_never_overdraw() {
    let gw = Harness::start(NO_UPSTREAM, &[]).await;
    let owner = gw.state.owners.create(NewOwner::named("frank")).await.unwrap();
    gw.state.balance.recharge(owner.id, 5.0, None, None).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..20 {
        let state = gw.state.clone();
        let user_id = owner.id;
        handles.push(tokio::spawn(async move {
            state.balance.consume(user_id, 0.5, None, None, false).await
        }));
    }
    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(GatewayError::InsufficientBalance { .. }) => {}
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }

    assert_eq!(succeeded, 10);
    assert!(close(gw.state.balance.balance(owner.id).await.unwrap(), 0.0));
    assert!(gw.state.balance.audit(owner.id).await.unwrap().is_consistent());
}

#[tokio::test]
async fn settlement_keeps_usage_when_balance_cannot_cover_it() {
    let gw = Harness::start(NO_UPSTREAM, &[("BALANCE_BILLING", "true")]).await;
    let (owner, key, _secret) = gw.owner_with_key("grace", KeyPolicy::default()).await;
    gw.state.balance.recharge(owner.id, 0.1, None, None).await.unwrap();

    let mut call = MeteredCall::admitted(&key, "/v1/chat/completions", "POST", None, false);
    call.forwarding();
    assert_eq!(call.phase(), CallPhase::Forwarding);
    let settled = gw
        .state
        .meter
        .settle(
            call,
            CallOutcome::Responded {
                status: 200,
                tokens: TokenUsage::new(500, 500, None),
                note: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(settled.phase, CallPhase::Completed);
    assert!(close(settled.billed, 1.0));
    assert!(settled.balance.is_none());
    assert_eq!(settled.usage.total_tokens, 1000);
    assert!(close(gw.state.balance.balance(owner.id).await.unwrap(), 0.1));

    let key = gw.state.credentials.get(key.id).await.unwrap();
    assert_eq!(key.total_requests, 1);
    assert!(close(key.total_cost, 1.0));
}

#[tokio::test]
async fn timed_out_calls_record_without_billing() {
    let gw = Harness::start(NO_UPSTREAM, &[]).await;
    let (owner, key, _secret) = gw.owner_with_key("heidi", KeyPolicy::default()).await;

    let call = MeteredCall::admitted(&key, "/v1/completions", "POST", Some("m".into()), true);
    let settled = gw.state.meter.settle(call, CallOutcome::TimedOut).await.unwrap();

    assert_eq!(settled.phase, CallPhase::TimedOut);
    assert_eq!(settled.usage.status_code, Some(504));
    assert_eq!(settled.usage.error_message.as_deref(), Some("Upstream timeout"));
    assert_eq!(settled.billed, 0.0);

    let owner = gw.state.owners.get(owner.id).await.unwrap();
    assert_eq!(owner.quota_used, 0.0);
    let fetched = gw
        .state
        .usage
        .get_by_request_id(&settled.usage.request_id)
        .await
        .unwrap();
    assert!(fetched.is_streaming);
}

#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test(flavor = "current_thread")]
async fn every_balance_mutation_is_logged() {
    let capture = LogCapture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let gw = Harness::start(NO_UPSTREAM, &[]).await;
    let owner = gw.state.owners.create(NewOwner::named("ivan")).await.unwrap();
    let ledger = &gw.state.balance;
    ledger.recharge(owner.id, 2.0, None, None).await.unwrap();
    ledger.consume(owner.id, 0.5, None, None, false).await.unwrap();
    ledger.adjust(owner.id, -0.25, Some("manual fix")).await.unwrap();

    let logs = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
    assert!(logs.contains("balance credited"));
    assert!(logs.contains("balance debited"));
    let adjusted = logs
        .lines()
        .find(|l| l.contains("balance adjusted"))
        .expect("adjust logs a line");
    assert!(adjusted.contains(&format!("user_id={}", owner.id)));
    assert!(adjusted.contains("balance=1.25"));
}

#[tokio::test]
async fn owner_timestamps_serialize_as_rfc3339() {
    let gw = Harness::start(NO_UPSTREAM, &[]).await;
    let owner = gw.state.owners.create(NewOwner::named("judy")).await.unwrap();

    let json = serde_json::to_value(&owner).unwrap();
    let created = json["created_at"].as_str().expect("timestamp is a string");
    let parsed = chrono::DateTime::parse_from_rfc3339(created).unwrap();
    assert_eq!(parsed.timestamp(), owner.created_at.timestamp());
}
