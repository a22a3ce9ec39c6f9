//! The active-connection counter is process-wide, so this file holds a single test
//! to keep other tests from moving it concurrently.

mod common;

use std::sync::Arc;

use cluster_dal::{Command, Observers, Repository, Session, active_connection_count};
use common::{mock_repository, registry};

#[tokio::test]
async fn test_counter_follows_open_and_close() {
    let repository = Arc::new(
        Repository::from_config(&mock_repository("a", "mock://healthy", 0), &registry()).unwrap(),
    );
    let baseline = active_connection_count();

    // A connection opened for one operation closes with it
    let mut session = Session::open(
        Arc::clone(&repository),
        Some(Command::new("SELECT 1")),
        Observers::default(),
    )
    .unwrap();
    let _: i64 = session.execute_scalar().await.unwrap();
    assert_eq!(active_connection_count(), baseline);

    // An explicitly opened connection stays open across operations
    session.connect().await.unwrap();
    assert_eq!(active_connection_count(), baseline + 1);
    let _: i64 = session.execute_scalar().await.unwrap();
    assert_eq!(active_connection_count(), baseline + 1);

    // A second session adds its own connection
    let mut other = Session::new(Arc::clone(&repository), Observers::default());
    other.connect().await.unwrap();
    assert_eq!(active_connection_count(), baseline + 2);

    session.dispose().await.unwrap();
    assert_eq!(active_connection_count(), baseline + 1);
    session.dispose().await.unwrap();
    assert_eq!(active_connection_count(), baseline + 1);

    // Dropping an open session outside a transaction closes synchronously
    drop(other);
    assert_eq!(active_connection_count(), baseline);
}
