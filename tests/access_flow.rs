//! End-to-end access flows through the public API, with a scripted NAS.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use adportal::ads::{Ad, AdGate, CatalogAdSelector, Completion};
use adportal::cache::{MemoryCache, SessionCache};
use adportal::config::SessionConfig;
use adportal::error::AccessError;
use adportal::mac::MacAddress;
use adportal::radius::NetworkAccessClient;
use adportal::session::{AccessSessionManager, DeviceMeta, SessionId, SessionStatus};
use adportal::storage::{AccessStore, SqliteStore};
use adportal::sweeper::{SweepReport, Sweeper};
use adportal::token::TokenSigner;

#[derive(Default)]
struct ScriptedNas {
    provisions: AtomicUsize,
    grants: AtomicUsize,
    revokes: AtomicUsize,
    fail_grant: AtomicBool,
    grant_delay_ms: u64,
    revoke_delay_ms: u64,
    /// Order in which grants and revokes reached the NAS.
    events: Mutex<Vec<&'static str>>,
}

impl ScriptedNas {
    fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetworkAccessClient for ScriptedNas {
    async fn provision(&self, _username: &str, _password: &str, _timeout: u32) -> anyhow::Result<()> {
        self.provisions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn grant(&self, _mac: MacAddress, _ip: Option<IpAddr>, _timeout: u32) -> anyhow::Result<()> {
        if self.grant_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.grant_delay_ms)).await;
        }
        if self.fail_grant.load(Ordering::SeqCst) {
            anyhow::bail!("CoA-NAK: Session-Context-Not-Found");
        }
        self.grants.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().push("grant");
        Ok(())
    }

    async fn revoke(&self, _mac: MacAddress) -> anyhow::Result<()> {
        if self.revoke_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.revoke_delay_ms)).await;
        }
        self.revokes.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().push("revoke");
        Ok(())
    }
}

struct Portal {
    _dir: TempDir,
    store: Arc<SqliteStore>,
    cache: MemoryCache,
    nas: Arc<ScriptedNas>,
    manager: Arc<AccessSessionManager>,
    gate: AdGate,
}

impl Portal {
    /// A second manager over the same database with its own cache, the way
    /// the CLI runs next to the daemon.
    fn second_process(&self) -> AccessSessionManager {
        AccessSessionManager::new(
            self.store.clone(),
            Arc::new(MemoryCache::new()),
            self.nas.clone(),
            TokenSigner::new("flow-secret", "adportal-test", 3600),
            SessionConfig::default(),
        )
    }
}

fn portal_with(nas: ScriptedNas, policy: SessionConfig) -> Portal {
    let dir = TempDir::new().unwrap();
    let pool = adportal::storage::open_pool(dir.path().join("flow.db").to_str().unwrap()).unwrap();
    let store = Arc::new(SqliteStore::new(pool));
    let cache = MemoryCache::new();
    let nas = Arc::new(nas);
    let signer = TokenSigner::new("flow-secret", "adportal-test", 3600);
    let manager = Arc::new(AccessSessionManager::new(
        store.clone(),
        Arc::new(cache.clone()),
        nas.clone(),
        signer.clone(),
        policy,
    ));
    let catalog = CatalogAdSelector::new(vec![Ad {
        id: "promo-30".into(),
        name: "Thirty seconds".into(),
        video_url: "/ads/videos/promo-30.mp4".into(),
        duration_seconds: 30,
        advertiser: Some("Local Cafe".into()),
    }]);
    let gate = AdGate::new(store.clone(), Arc::new(catalog), signer, 80);
    Portal {
        _dir: dir,
        store,
        cache,
        nas,
        manager,
        gate,
    }
}

fn portal() -> Portal {
    portal_with(ScriptedNas::default(), SessionConfig::default())
}

fn mac() -> MacAddress {
    "aa:bb:cc:dd:ee:ff".parse().unwrap()
}

/// Request access and watch the ad to completion. Returns the completion token.
async fn watch_ad(p: &Portal, mac: MacAddress) -> (SessionId, String) {
    let session = p.manager.request_access(mac, None, DeviceMeta::default()).await.unwrap();
    let dispatched = p.gate.dispatch_ad(session.session_id).await.unwrap();
    p.gate.report_progress(dispatched.impression_id, 28).await.unwrap();
    match p.gate.evaluate(dispatched.impression_id, 30).await.unwrap() {
        Completion::Accepted { token } => (session.session_id, token),
        other => panic!("expected acceptance, got {:?}", other),
    }
}

#[tokio::test]
async fn ad_watch_to_active_session() {
    let p = portal();
    let session = p
        .manager
        .request_access(mac(), Some("10.0.0.23".parse().unwrap()), DeviceMeta::default())
        .await
        .unwrap();
    assert_eq!(session.status, SessionStatus::Pending);

    let imp = p.gate.create_impression(session.session_id, "promo-30", 30, mac()).await.unwrap();

    let first = p.gate.evaluate_completion(imp.impression_id, 20, 30, 80).await.unwrap();
    assert_eq!(
        first,
        Completion::Rejected {
            reason: "insufficient watch time".into()
        }
    );
    // Rejection leaves the impression untouched.
    let stored = p.store.get_impression(imp.impression_id).await.unwrap().unwrap();
    assert!(!stored.completed);
    assert_eq!(stored.watched_duration_seconds, 0);

    let token = match p.gate.evaluate_completion(imp.impression_id, 25, 30, 80).await.unwrap() {
        Completion::Accepted { token } => token,
        other => panic!("expected acceptance, got {:?}", other),
    };

    let activation = p.manager.activate(session.session_id, Some(&token)).await.unwrap();
    assert_eq!(activation.credentials.username, "aabbccddeeff");
    assert_eq!(p.nas.grants.load(Ordering::SeqCst), 1);
    assert_eq!(p.nas.provisions.load(Ordering::SeqCst), 1);

    let status = p.manager.check_status(session.session_id).await.unwrap();
    assert_eq!(status.status, SessionStatus::Active);
    let remaining = status.remaining_seconds.unwrap();
    assert!(remaining > 890 && remaining <= 900);
}

#[tokio::test]
async fn activation_without_impression_is_unauthorized() {
    let p = portal();
    let session = p.manager.request_access(mac(), None, DeviceMeta::default()).await.unwrap();

    let err = p.manager.activate(session.session_id, None).await.unwrap_err();
    assert!(matches!(err, AccessError::Unauthorized(_)));
    let err = p.manager.activate(session.session_id, Some("forged.token.value")).await.unwrap_err();
    assert!(matches!(err, AccessError::Unauthorized(_)));

    assert_eq!(p.nas.grants.load(Ordering::SeqCst), 0);
    let stored = p.store.get_session(session.session_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Pending);
}

#[tokio::test]
async fn sweeper_expires_session_past_budget_once() {
    let policy = SessionConfig {
        time_budget_secs: 1,
        ..SessionConfig::default()
    };
    let p = portal_with(ScriptedNas::default(), policy);
    let (sid, token) = watch_ad(&p, mac()).await;
    p.manager.activate(sid, Some(&token)).await.unwrap();

    let sweeper = Sweeper::new(p.manager.clone());
    assert_eq!(sweeper.sweep_once().await.unwrap(), Some(SweepReport::default()));

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let report = sweeper.sweep_once().await.unwrap().unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(p.nas.revokes.load(Ordering::SeqCst), 1);

    let stored = p.store.get_session(sid).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Expired);
    assert!(stored.session_end.is_some());
    assert!(p.cache.get(sid).await.unwrap().is_none());

    // Lazy expiry racing the sweeper afterwards changes nothing.
    assert!(!p.manager.expire(sid).await.unwrap());
    let status = p.manager.check_status(sid).await.unwrap();
    assert_eq!(status.status, SessionStatus::Expired);
    assert_eq!(p.nas.revokes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_activations_have_one_winner() {
    let nas = ScriptedNas {
        grant_delay_ms: 150,
        ..ScriptedNas::default()
    };
    let p = portal_with(nas, SessionConfig::default());
    let (sid, token) = watch_ad(&p, mac()).await;

    let (a, b) = tokio::join!(
        p.manager.activate(sid, Some(&token)),
        p.manager.activate(sid, Some(&token))
    );

    let (ok, err) = match (a, b) {
        (Ok(ok), Err(err)) | (Err(err), Ok(ok)) => (ok, err),
        (a, b) => panic!("expected exactly one winner, got {:?} / {:?}", a.is_ok(), b.is_ok()),
    };
    assert_eq!(ok.session_id, sid);
    assert!(matches!(err, AccessError::InvalidState(_)));
    assert_eq!(p.nas.grants.load(Ordering::SeqCst), 1);
    assert_eq!(p.store.active_sessions_for_mac(mac()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_grant_keeps_session_pending() {
    let p = portal();
    let (sid, token) = watch_ad(&p, mac()).await;
    p.nas.fail_grant.store(true, Ordering::SeqCst);

    let err = p.manager.activate(sid, Some(&token)).await.unwrap_err();
    assert!(matches!(err, AccessError::Upstream(_)));

    // Read the durable record directly, not through the manager.
    let stored = p.store.get_session(sid).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Pending);
    assert!(stored.session_start.is_none());
    assert!(p.store.active_sessions_for_mac(mac()).await.unwrap().is_empty());
}

#[tokio::test]
async fn expire_twice_revokes_once() {
    let p = portal();
    let (sid, token) = watch_ad(&p, mac()).await;
    p.manager.activate(sid, Some(&token)).await.unwrap();

    let (first, second) = tokio::join!(p.manager.expire(sid), p.manager.expire(sid));
    assert_eq!(
        [first.unwrap(), second.unwrap()].iter().filter(|won| **won).count(),
        1
    );
    assert_eq!(p.nas.revokes.load(Ordering::SeqCst), 1);
    assert_eq!(
        p.store.get_session(sid).await.unwrap().unwrap().status,
        SessionStatus::Expired
    );
}

#[tokio::test]
async fn repeated_request_reuses_session() {
    let p = portal();
    let a = p.manager.request_access(mac(), None, DeviceMeta::default()).await.unwrap();
    let b = p.manager.request_access(mac(), None, DeviceMeta::default()).await.unwrap();
    assert_eq!(a.session_id, b.session_id);
    assert!(a.created && !b.created);

    // Same device, MAC written differently.
    let c = p
        .manager
        .request_access("AA-BB-CC-DD-EE-FF".parse().unwrap(), None, DeviceMeta::default())
        .await
        .unwrap();
    assert_eq!(c.session_id, a.session_id);
}

#[tokio::test]
async fn one_active_session_per_device() {
    // No pending reuse, so the device can open two pending sessions.
    let policy = SessionConfig {
        pending_reuse_secs: 0,
        ..SessionConfig::default()
    };
    let p = portal_with(ScriptedNas::default(), policy);
    let (first, token1) = watch_ad(&p, mac()).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let (second, token2) = watch_ad(&p, mac()).await;
    assert_ne!(first, second);

    p.manager.activate(first, Some(&token1)).await.unwrap();
    let err = p.manager.activate(second, Some(&token2)).await.unwrap_err();
    assert!(matches!(err, AccessError::InvalidState(_)));

    let active = p.store.active_sessions_for_mac(mac()).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, first);
    // Refused before the NAS was touched.
    assert_eq!(p.nas.grants.load(Ordering::SeqCst), 1);
    assert_eq!(p.nas.provisions.load(Ordering::SeqCst), 1);
    assert_eq!(p.nas.revokes.load(Ordering::SeqCst), 0);
    assert_eq!(
        p.store.get_session(second).await.unwrap().unwrap().status,
        SessionStatus::Pending
    );
}

#[tokio::test]
async fn disconnect_ends_active_session() {
    let p = portal();
    let (sid, token) = watch_ad(&p, mac()).await;
    let activation = p.manager.activate(sid, Some(&token)).await.unwrap();

    let by_token = p.manager.session_for_token(&activation.access_token).unwrap();
    assert_eq!(by_token, sid);
    p.manager.disconnect_by_request(sid).await.unwrap();

    assert_eq!(p.nas.revokes.load(Ordering::SeqCst), 1);
    let status = p.manager.check_status_by_token(&activation.access_token).await.unwrap();
    assert_eq!(status.status, SessionStatus::Terminated);
    assert_eq!(status.remaining_seconds, None);

    // A terminated device starts over with a fresh pending session.
    let next = p.manager.request_access(mac(), None, DeviceMeta::default()).await.unwrap();
    assert_ne!(next.session_id, sid);
    assert_eq!(next.status, SessionStatus::Pending);
}

#[tokio::test]
async fn completion_is_judged_against_the_dispatched_ad() {
    let p = portal();
    let session = p.manager.request_access(mac(), None, DeviceMeta::default()).await.unwrap();
    let dispatched = p.gate.dispatch_ad(session.session_id).await.unwrap();
    assert_eq!(dispatched.ad.duration_seconds, 30);

    // The device claims the 30 s ad was one second long.
    let err = p
        .gate
        .evaluate_completion(dispatched.impression_id, 1, 1, 80)
        .await
        .unwrap_err();
    assert!(matches!(err, AccessError::InvalidState(_)));
    assert!(matches!(
        p.gate.evaluate(dispatched.impression_id, 1).await.unwrap(),
        Completion::Rejected { .. }
    ));

    let stored = p.store.get_impression(dispatched.impression_id).await.unwrap().unwrap();
    assert!(!stored.completed);
    assert!(matches!(
        p.manager.activate(session.session_id, None).await,
        Err(AccessError::Unauthorized(_))
    ));
    assert_eq!(p.nas.grants.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn disconnect_during_activation_wins_and_grant_is_undone() {
    let nas = ScriptedNas {
        grant_delay_ms: 100,
        ..ScriptedNas::default()
    };
    let p = portal_with(nas, SessionConfig::default());
    let (sid, token) = watch_ad(&p, mac()).await;

    let (activated, disconnected) = tokio::join!(p.manager.activate(sid, Some(&token)), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        p.manager.disconnect_by_request(sid).await
    });

    disconnected.unwrap();
    assert!(matches!(activated, Err(AccessError::InvalidState(_))));
    assert_eq!(p.nas.events(), vec!["grant", "revoke"]);
    assert_eq!(
        p.store.get_session(sid).await.unwrap().unwrap().status,
        SessionStatus::Terminated
    );
    assert!(p.store.active_sessions_for_mac(mac()).await.unwrap().is_empty());
    assert_eq!(p.manager.check_status(sid).await.unwrap().status, SessionStatus::Terminated);
}

#[tokio::test]
async fn sweep_never_revokes_after_a_newer_grant() {
    let nas = ScriptedNas {
        revoke_delay_ms: 100,
        ..ScriptedNas::default()
    };
    let policy = SessionConfig {
        time_budget_secs: 1,
        pending_reuse_secs: 0,
        ..SessionConfig::default()
    };
    let p = portal_with(nas, policy);
    let (first, token1) = watch_ad(&p, mac()).await;
    p.manager.activate(first, Some(&token1)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;
    // Budget gone but not swept: the device watches another ad.
    let (second, token2) = watch_ad(&p, mac()).await;
    assert_ne!(first, second);

    let sweeper = Sweeper::new(p.manager.clone());
    let (swept, activated) = tokio::join!(sweeper.sweep_once(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        p.manager.activate(second, Some(&token2)).await
    });
    swept.unwrap();
    activated.unwrap();

    // Whatever the interleaving, the device ends up admitted.
    assert_eq!(p.nas.events().last(), Some(&"grant"));
    assert!(p.nas.revokes.load(Ordering::SeqCst) <= 1);
    assert_eq!(
        p.store.get_session(first).await.unwrap().unwrap().status,
        SessionStatus::Expired
    );
    assert_eq!(
        p.store.get_session(second).await.unwrap().unwrap().status,
        SessionStatus::Active
    );
}

#[tokio::test]
async fn status_follows_disconnect_from_another_process() {
    let p = portal();
    let (sid, token) = watch_ad(&p, mac()).await;
    p.manager.activate(sid, Some(&token)).await.unwrap();
    assert_eq!(p.cache.get(sid).await.unwrap().unwrap().status, SessionStatus::Active);

    p.second_process().disconnect_by_request(sid).await.unwrap();

    let status = p.manager.check_status(sid).await.unwrap();
    assert_eq!(status.status, SessionStatus::Terminated);
    assert_eq!(status.remaining_seconds, None);
    assert!(p.cache.get(sid).await.unwrap().is_none());
}
