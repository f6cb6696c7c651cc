//! Live session protocol against a running controller

mod common;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use common::*;
use pretty_assertions::assert_eq;
use rdio_core::{
    Access, Call, CallMeta, Command, Config, Message, Scope, SystemScope, TalkgroupScope,
};
use rdio_server::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

async fn next(rx: &mut mpsc::Receiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap()
}

async fn quiet(rx: &mut mpsc::Receiver<Message>) -> bool {
    tokio::time::timeout(Duration::from_millis(100), rx.recv())
        .await
        .is_err()
}

fn call(talkgroup_ref: u32) -> Call {
    Call {
        audio: vec![3; 256],
        audio_name: "call.mp3".to_string(),
        audio_mime: "audio/mpeg".to_string(),
        timestamp: Utc::now(),
        meta: CallMeta {
            system_ref: Some(1),
            talkgroup_ref: Some(talkgroup_ref),
            ..CallMeta::default()
        },
        ..Call::default()
    }
}

fn fire_only() -> Access {
    Access {
        code: "fire".to_string(),
        ident: "fire-crew".to_string(),
        scope: Scope::List(vec![SystemScope {
            system_ref: 1,
            talkgroups: TalkgroupScope::List([10].into()),
        }]),
        ..Access::unrestricted()
    }
}

#[tokio::test]
async fn test_restricted_session_flow() {
    let store = seeded_store();
    store.add_access(fire_only());
    let controller = start_controller(&store, Config::default()).await;

    let (client, mut rx) = Client::new(8);
    controller.register(Arc::clone(&client)).await;
    assert_eq!(next(&mut rx).await.command, Command::Pin);

    controller
        .process_message(
            &client,
            Message::new(Command::Pin).with_payload(STANDARD.encode("fire")),
        )
        .await;
    let config = next(&mut rx).await;
    assert_eq!(config.command, Command::Config);
    let payload = config.payload.unwrap();
    let talkgroups = payload["systems"][0]["talkgroups"].as_array().unwrap();
    assert_eq!(talkgroups.len(), 1);
    assert_eq!(talkgroups[0]["id"], json!(10));

    controller
        .process_message(
            &client,
            Message::new(Command::LivefeedMap).with_payload(json!({"1": {"10": true, "20": true}})),
        )
        .await;
    assert_eq!(next(&mut rx).await.payload, Some(json!(true)));

    controller.ingest(call(20)).await.unwrap();
    assert!(quiet(&mut rx).await);

    controller.ingest(call(10)).await.unwrap();
    let delivered = next(&mut rx).await;
    assert_eq!(delivered.command, Command::Call);
    assert_eq!(delivered.payload.unwrap()["talkgroup"], json!(10));

    controller.stop();
}

#[tokio::test]
async fn test_delayed_talkgroup_hidden_until_release() {
    let store = seeded_store();
    store.add_system(rdio_core::System {
        system_ref: 2,
        label: "Tactical".to_string(),
        delay: 10,
        talkgroups: vec![rdio_core::Talkgroup {
            talkgroup_ref: 5,
            label: "Tac".to_string(),
            ..rdio_core::Talkgroup::default()
        }],
        ..rdio_core::System::default()
    });
    let controller = start_controller(&store, Config::default()).await;

    let (client, mut rx) = Client::new(8);
    controller.register(Arc::clone(&client)).await;
    assert_eq!(next(&mut rx).await.command, Command::Config);
    controller
        .process_message(
            &client,
            Message::new(Command::LivefeedMap).with_payload(json!({"2": {"5": true}})),
        )
        .await;
    assert_eq!(next(&mut rx).await.command, Command::LivefeedMap);

    let mut delayed = call(5);
    delayed.meta.system_ref = Some(2);
    controller.ingest(delayed).await.unwrap();
    assert!(wait_for_calls(&store, 1).await);
    assert!(quiet(&mut rx).await);
    assert_eq!(controller.delayer().pending(), 1);

    controller
        .process_message(&client, Message::new(Command::ListCalls))
        .await;
    let listed = next(&mut rx).await.payload.unwrap();
    assert_eq!(listed["count"], json!(1));
    assert_eq!(listed["results"], json!([]));

    controller.stop();
}

#[tokio::test]
async fn test_listener_count_follows_sessions() {
    let store = seeded_store();
    let mut config = Config::default();
    config.options.show_listeners_count = true;
    let controller = start_controller(&store, config).await;

    let (first, mut first_rx) = Client::new(8);
    controller.register(Arc::clone(&first)).await;
    let mut seen = vec![next(&mut first_rx).await, next(&mut first_rx).await];
    seen.sort_by(|a, b| a.command.as_str().cmp(b.command.as_str()));
    assert_eq!(seen[1].command, Command::ListenersCount);
    assert_eq!(seen[1].payload, Some(json!(1)));

    let (second, mut second_rx) = Client::new(8);
    controller.register(Arc::clone(&second)).await;
    let _ = next(&mut second_rx).await;
    let _ = next(&mut second_rx).await;
    assert_eq!(next(&mut first_rx).await.payload, Some(json!(2)));

    controller.unregister(second).await;
    assert_eq!(next(&mut first_rx).await.payload, Some(json!(1)));

    controller.stop();
}
