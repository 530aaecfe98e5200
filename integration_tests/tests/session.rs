mod common;

use std::fs;

use anyhow::Result;
use common::{test_config, wait_until, FakeServer, WAIT};
use inject_core::{
    session_dir, Command, Connection, ConnectionConfig, ConnectionError, ConnectionState,
    InjectionType, SESSION_FILE,
};

#[test]
fn a_second_connection_cannot_share_an_identifier() -> Result<()> {
    let world = tempfile::tempdir()?;
    let server = FakeServer::start(world.path(), "shared", 0);
    let first = Connection::new(world.path(), server.log(), test_config("shared"))?;
    first.open(Some(WAIT))?;

    let second = Connection::new(world.path(), server.log(), test_config("shared"))?;
    let err = second.open(Some(WAIT)).unwrap_err();
    assert!(matches!(err, ConnectionError::DuplicateSession { .. }));
    assert_eq!(second.state(), ConnectionState::Closed);

    // Another identifier in the same world is independent.
    let other_server = FakeServer::start(world.path(), "other", 0);
    let other = Connection::new(world.path(), other_server.log(), test_config("other"))?;
    other.open(Some(WAIT))?;

    first.close()?;
    second.open(Some(WAIT))?;
    assert_eq!(second.state(), ConnectionState::Active);
    Ok(())
}

#[test]
fn ids_keep_increasing_across_restarts() -> Result<()> {
    let world = tempfile::tempdir()?;
    let server = FakeServer::start(world.path(), "restart", 0);

    let first = Connection::new(world.path(), server.log(), test_config("restart"))?;
    first.open(Some(WAIT))?;
    first.pause();
    first.inject(InjectionType::Impulse, Command::new("say before restart"));
    assert_eq!(first.flush()?, Some(1));
    first.close()?;
    drop(first);

    let dir = session_dir(world.path(), "restart");
    assert_eq!(fs::read_to_string(dir.join(SESSION_FILE))?, "2");

    let second = Connection::new(world.path(), server.log(), test_config("restart"))?;
    assert_eq!(second.structure_id(), 2);
    second.open(Some(WAIT))?;
    assert_eq!(second.last_confirmed_id(), Some(2));
    assert_eq!(second.structure_id(), 3);
    assert!(server
        .executed()
        .iter()
        .any(|text| text == "say before restart"));
    Ok(())
}

#[test]
fn empty_flush_writes_nothing() -> Result<()> {
    let world = tempfile::tempdir()?;
    let server = FakeServer::start(world.path(), "empty", 0);
    let connection = Connection::new(world.path(), server.log(), test_config("empty"))?;
    connection.open(Some(WAIT))?;
    connection.pause();

    let dir = session_dir(world.path(), "empty");
    let before = fs::read_to_string(dir.join(SESSION_FILE))?;
    assert_eq!(connection.flush()?, None);
    assert_eq!(connection.structure_id(), 1);
    assert_eq!(fs::read_to_string(dir.join(SESSION_FILE))?, before);
    assert!(!dir.join("1.nbt").exists());
    Ok(())
}

#[test]
fn confirmed_packets_are_cleaned_up() -> Result<()> {
    let world = tempfile::tempdir()?;
    let server = FakeServer::start(world.path(), "tidy", 0);
    let config = ConnectionConfig {
        probe_interval: 2,
        ..test_config("tidy")
    };
    let connection = Connection::new(world.path(), server.log(), config)?;
    connection.open(Some(WAIT))?;
    connection.pause();

    // The third flush carries a probe; confirming it clears everything before it.
    for round in 0..3 {
        connection.inject(InjectionType::Impulse, Command::new(format!("say {round}")));
        connection.flush()?;
    }
    connection.inject(InjectionType::Impulse, Command::new("say last"));
    let last = connection.flush()?.unwrap_or_default();
    assert_eq!(last, 4);

    let dir = session_dir(world.path(), "tidy");
    let tidy = wait_until(WAIT, || {
        (0..last).all(|id| !dir.join(format!("{id}.nbt")).exists())
    });
    assert!(tidy);
    Ok(())
}
