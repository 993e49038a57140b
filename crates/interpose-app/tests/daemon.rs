use std::sync::Arc;
use std::thread;
use std::time::Duration;

use interpose_app::client::{ApiClient, ClientError};
use interpose_app::daemon::{serve, DaemonOptions};
use interpose_core::testing::FakeIptables;
use interpose_core::{ProxyState, StateEvent, Target};
use interpose_server::ServerConfig;
use interpose_storage::Database;
use tokio::sync::oneshot;

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn wait_until_up(client: &ApiClient) -> ProxyState {
    for _ in 0..250 {
        if let Ok(state) = client.state() {
            return state;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("daemon did not come up at {}", client.base_url());
}

#[test]
fn daemon_serves_client_commands() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("interpose.db");
    let port = free_port();
    let fake = FakeIptables::new();

    let options = DaemonOptions {
        db_path: Some(db_path.clone()),
        shell: "su".into(),
        api: ServerConfig::default().with_port(port),
    };
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let daemon = runtime.spawn(serve(options, Arc::new(fake.clone()), async move {
        let _ = stop_rx.await;
    }));

    let client = ApiClient::for_port("127.0.0.1", port);
    let initial = wait_until_up(&client);
    assert_eq!(initial, ProxyState::inactive(Target::default()));

    let target = Target::parse("10.0.0.9", 9090).unwrap();
    let state = client
        .start(Some("10.0.0.9".into()), Some("9090".into()))
        .unwrap();
    assert_eq!(state, ProxyState::active(target));
    assert_eq!(fake.destinations(), vec![(80, target), (443, target)]);
    assert_eq!(client.settings().unwrap().port, 9090);

    let err = client.start(Some("not-an-ip".into()), None).unwrap_err();
    match err {
        ClientError::Api { status, code, .. } => {
            assert_eq!(status, 400);
            assert_eq!(code, "invalid_target");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    fake.deny(true);
    let err = client.stop().unwrap_err();
    assert_eq!(err.code(), "permission_denied");
    assert!(client.state().unwrap().active);
    fake.deny(false);

    let watcher = {
        let client = client.clone();
        thread::spawn(move || {
            let mut events = Vec::new();
            client
                .watch(|event| {
                    let done = matches!(&event, StateEvent::Snapshot { state } if !state.active);
                    events.push(event);
                    !done
                })
                .unwrap();
            events
        })
    };
    thread::sleep(Duration::from_millis(100));
    assert!(!client.toggle().unwrap().active);
    assert!(fake.installed_rules().is_empty());

    let events = watcher.join().unwrap();
    assert_eq!(
        events.last(),
        Some(&StateEvent::Snapshot {
            state: ProxyState::inactive(target)
        })
    );

    stop_tx.send(()).unwrap();
    runtime.block_on(daemon).unwrap().unwrap();
    assert!(client.state().is_err());

    let db = Database::with_path(&db_path).unwrap();
    assert_eq!(db.load_target(), target);
}
