//! End-to-end relay tests
//!
//! A real router and identity store sit between recording radio and chat
//! ports. Covers:
//! - Radio text relayed to the bound room and recorded
//! - Unbound channels and unmapped replies/reactions producing nothing
//! - Loopback suppression and remote-mesh reformatting
//! - Reply and reaction bridging in both directions
//! - Interaction and broadcast policy gating the store
//! - Plugin consumption and plugin timeouts
//! - The relay service: queues, duplicates, direct sends and shutdown

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use meshrelay_core::{
    AsyncBridge, ChatMsgType, IdentityMetadata, LinkId, Linkage, MessageMapping, RelayConfig,
    RelayUnit, BROADCAST_ADDR, RADIO_TEXT_LIMIT,
};
use meshrelay_router::test_utils::{RecordingChat, RecordingRadio};
use meshrelay_router::{
    DropReason, PluginHost, RelayService, RelayTarget, RouteOutcome, Router,
};
use meshrelay_state::MessageIdentityStore;

const ROOM: &str = "!room:example.org";
const ALICE_NODE: u32 = 0xa1b2c3d4;
const MY_NODE: u32 = 0x00000001;

fn config(radio_extra: &str, tail: &str) -> Arc<RelayConfig> {
    let toml = format!(
        r#"
        [radio]
        connection_type = "tcp"
        host = "radio.lan"
        meshnet_name = "Home"
        {radio_extra}

        [chat]
        homeserver = "https://matrix.example.org"
        access_token = "token"

        [[rooms]]
        id = "{ROOM}"
        radio_channel = 0

        {tail}
    "#
    );
    Arc::new(RelayConfig::from_toml_str(&toml).unwrap())
}

const INTERACTIONS: &str = "[message_interactions]\nreactions = true\nreplies = true";

struct Harness {
    router: Router,
    radio: Arc<RecordingRadio>,
    chat: Arc<RecordingChat>,
    store: MessageIdentityStore,
}

async fn harness(config: Arc<RelayConfig>) -> Harness {
    let radio = Arc::new(RecordingRadio::new(MY_NODE));
    radio.add_node(ALICE_NODE, "Alice Node", "ALI");
    let chat = Arc::new(RecordingChat::new("@relay:example.org"));
    chat.set_display_name("@alice:example.org", "Alice");
    let store = MessageIdentityStore::in_memory().await.unwrap();
    let bridge = Arc::new(AsyncBridge::start(tokio::runtime::Handle::current()));
    let router = Router::new(config, radio.clone(), chat.clone(), store.clone(), bridge);
    Harness {
        router,
        radio,
        chat,
        store,
    }
}

/// Poll until `check` holds, for up to a second
async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

async fn rows_eventually(store: &MessageIdentityStore, expected: i64) {
    for _ in 0..100 {
        if store.len().await.unwrap() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("store never reached {expected} rows");
}

/// Give background sends a chance to run before asserting nothing happened
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn mapping(radio_id: u32, event_id: &str, text: &str) -> MessageMapping {
    MessageMapping {
        radio_id,
        chat_event_id: event_id.to_string(),
        chat_room_id: ROOM.to_string(),
        text: text.to_string(),
        meshnet: "Home".to_string(),
    }
}

// ---------------------------------------------------------------- radio→chat

#[tokio::test]
async fn test_radio_text_relayed_and_recorded() {
    let h = harness(config("", "[message_interactions]\nreactions = true")).await;
    let unit = RelayUnit::radio_text(42, ALICE_NODE, BROADCAST_ADDR, 0, "hello mesh");

    let outcome = h.router.handle(unit).await;
    assert_eq!(
        outcome,
        RouteOutcome::Relayed {
            targets: vec![RelayTarget::Room(ROOM.into())]
        }
    );

    rows_eventually(&h.store, 1).await;
    let sent = h.chat.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].room_id, ROOM);
    assert_eq!(sent[0].message.body, "ALI[Home]: hello mesh");

    let identity = sent[0].message.identity.clone().unwrap();
    assert_eq!(identity.id, Some(42));
    assert_eq!(identity.longname.as_deref(), Some("Alice Node"));
    assert_eq!(identity.meshnet.as_deref(), Some("Home"));
    assert_eq!(identity.portnum.as_deref(), Some("TEXT_MESSAGE_APP"));
    assert_eq!(identity.text.as_deref(), Some("hello mesh"));

    let row = h.store.get_by_chat_event_id(&sent[0].event_id).await.unwrap().unwrap();
    assert_eq!(row.radio_id, 42);
    assert_eq!(row.text, "hello mesh");
}

#[tokio::test]
async fn test_unbound_channel_produces_nothing() {
    let h = harness(config("", INTERACTIONS)).await;
    let unit = RelayUnit::radio_text(42, ALICE_NODE, BROADCAST_ADDR, 3, "lost");

    assert_eq!(
        h.router.handle(unit).await,
        RouteOutcome::Dropped(DropReason::UnboundChannel)
    );
    settle().await;
    assert!(h.chat.sent().is_empty());
    assert_eq!(h.store.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_node_uses_raw_id() {
    let h = harness(config("", "")).await;
    let unit = RelayUnit::radio_text(1, 0x0badf00d, BROADCAST_ADDR, 0, "hi");
    h.router.handle(unit).await;

    eventually(|| h.chat.sent().len() == 1).await;
    assert_eq!(h.chat.sent()[0].message.body, "f00d[Home]: hi");
}

#[tokio::test]
async fn test_prefix_disabled_sends_bare_text() {
    let h = harness(config("prefix_enabled = false", "")).await;
    h.router
        .handle(RelayUnit::radio_text(1, ALICE_NODE, BROADCAST_ADDR, 0, "bare"))
        .await;
    eventually(|| h.chat.sent().len() == 1).await;
    assert_eq!(h.chat.sent()[0].message.body, "bare");
}

#[tokio::test]
async fn test_radio_reaction_without_mapping_is_noop() {
    let h = harness(config("", INTERACTIONS)).await;
    let unit = RelayUnit::radio_text(43, ALICE_NODE, BROADCAST_ADDR, 0, "👍").with_linkage(
        Linkage::Reaction {
            target: LinkId::Radio(999),
            emoji: "👍".into(),
        },
    );

    assert_eq!(
        h.router.handle(unit).await,
        RouteOutcome::Dropped(DropReason::MappingMissing)
    );
    settle().await;
    assert!(h.chat.sent().is_empty());
    assert!(h.radio.sent().is_empty());
    assert_eq!(h.store.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_radio_reaction_relayed_as_emote_and_not_stored() {
    let h = harness(config("", INTERACTIONS)).await;
    h.store.put(&mapping(42, "$orig", "hello mesh")).await.unwrap();

    let unit = RelayUnit::radio_text(43, ALICE_NODE, BROADCAST_ADDR, 0, "👍").with_linkage(
        Linkage::Reaction {
            target: LinkId::Radio(42),
            emoji: "👍".into(),
        },
    );
    h.router.handle(unit).await;

    eventually(|| h.chat.sent().len() == 1).await;
    let sent = &h.chat.sent()[0];
    assert_eq!(sent.message.msgtype, ChatMsgType::Emote);
    assert_eq!(sent.message.body, "[Alice Node/Home] reacted 👍 to \"hello mesh\"");
    let identity = sent.message.identity.clone().unwrap();
    assert_eq!(identity.emote, Some(true));
    assert_eq!(identity.reply_id, Some(42));

    settle().await;
    assert_eq!(h.store.len().await.unwrap(), 1);
}

#[tokio::test]
async fn test_radio_reply_threads_to_mapped_event() {
    let h = harness(config("", INTERACTIONS)).await;
    h.store.put(&mapping(42, "$orig", "question")).await.unwrap();

    let unit = RelayUnit::radio_text(44, ALICE_NODE, BROADCAST_ADDR, 0, "answer")
        .with_linkage(Linkage::Reply(LinkId::Radio(42)));
    h.router.handle(unit).await;

    rows_eventually(&h.store, 2).await;
    let sent = &h.chat.sent()[0];
    assert_eq!(sent.message.reply_to.as_deref(), Some("$orig"));
    assert_eq!(sent.message.body, "ALI[Home]: answer");
    let row = h.store.get_by_chat_event_id(&sent.event_id).await.unwrap().unwrap();
    assert_eq!(row.radio_id, 44);
}

#[tokio::test]
async fn test_interactions_disabled_store_untouched() {
    let h = harness(config("", "")).await;
    h.router
        .handle(RelayUnit::radio_text(1, ALICE_NODE, BROADCAST_ADDR, 0, "plain"))
        .await;
    let reaction = RelayUnit::radio_text(2, ALICE_NODE, BROADCAST_ADDR, 0, "👍").with_linkage(
        Linkage::Reaction {
            target: LinkId::Radio(1),
            emoji: "👍".into(),
        },
    );
    assert_eq!(
        h.router.handle(reaction).await,
        RouteOutcome::Dropped(DropReason::InteractionDisabled)
    );

    eventually(|| h.chat.sent().len() == 1).await;
    settle().await;
    assert_eq!(h.store.len().await.unwrap(), 0);
}

// ---------------------------------------------------------------- chat→radio

#[tokio::test]
async fn test_chat_text_prefixed_and_recorded() {
    let h = harness(config("", INTERACTIONS)).await;
    let unit = RelayUnit::chat_text(ROOM, "$ev1", "@alice:example.org", "hi radio");

    assert_eq!(
        h.router.handle(unit).await,
        RouteOutcome::Relayed {
            targets: vec![RelayTarget::Channel(0)]
        }
    );

    rows_eventually(&h.store, 1).await;
    let (packet_id, sent) = h.radio.sent()[0].clone();
    assert_eq!(sent.text, "Alice[M]: hi radio");
    assert_eq!(sent.channel, 0);
    assert_eq!(sent.destination, BROADCAST_ADDR);

    let row = h.store.get_by_chat_event_id("$ev1").await.unwrap().unwrap();
    assert_eq!(row.radio_id, packet_id);
    assert_eq!(row.text, "hi radio");
}

#[tokio::test]
async fn test_chat_reply_without_mapping_sends_nothing() {
    let h = harness(config("", INTERACTIONS)).await;
    let unit = RelayUnit::chat_text(ROOM, "$ev2", "@alice:example.org", "> <@bob> q\n\nanswer")
        .with_linkage(Linkage::Reply(LinkId::Chat("$unknown".into())));

    assert_eq!(
        h.router.handle(unit).await,
        RouteOutcome::Dropped(DropReason::MappingMissing)
    );
    settle().await;
    assert!(h.radio.sent().is_empty());
}

#[tokio::test]
async fn test_chat_reaction_without_mapping_is_noop() {
    let h = harness(config("", INTERACTIONS)).await;
    let unit = RelayUnit::chat_text(ROOM, "$react", "@alice:example.org", "👍").with_linkage(
        Linkage::Reaction {
            target: LinkId::Chat("$unknown".into()),
            emoji: "👍".into(),
        },
    );

    assert_eq!(
        h.router.handle(unit).await,
        RouteOutcome::Dropped(DropReason::MappingMissing)
    );
    settle().await;
    assert!(h.radio.sent().is_empty());
    assert_eq!(h.store.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_chat_reply_strips_quote_and_threads() {
    let h = harness(config("", INTERACTIONS)).await;
    h.store.put(&mapping(42, "$orig", "question")).await.unwrap();

    let unit = RelayUnit::chat_text(
        ROOM,
        "$ev3",
        "@alice:example.org",
        "> <@bob:example.org> question\n\nanswer",
    )
    .with_linkage(Linkage::Reply(LinkId::Chat("$orig".into())));
    h.router.handle(unit).await;

    rows_eventually(&h.store, 2).await;
    let (_, sent) = h.radio.sent()[0].clone();
    assert_eq!(sent.text, "Alice[M]: answer");
    assert_eq!(sent.reply_id, Some(42));
}

#[tokio::test]
async fn test_chat_reaction_sent_to_radio() {
    let h = harness(config("", INTERACTIONS)).await;
    h.store.put(&mapping(42, "$orig", "hello mesh")).await.unwrap();

    let unit = RelayUnit::chat_text(ROOM, "$react", "@alice:example.org", "👍").with_linkage(
        Linkage::Reaction {
            target: LinkId::Chat("$orig".into()),
            emoji: "👍".into(),
        },
    );
    h.router.handle(unit).await;

    eventually(|| h.radio.sent().len() == 1).await;
    assert_eq!(h.radio.texts(), vec!["Alice[M]: reacted 👍 to \"hello mesh\""]);
    settle().await;
    assert_eq!(h.store.len().await.unwrap(), 1);
}

#[tokio::test]
async fn test_loopback_and_own_messages_ignored() {
    let h = harness(config("", INTERACTIONS)).await;
    let looped = RelayUnit::chat_text(ROOM, "$loop", "@relay:example.org", "ALI[Home]: hi")
        .with_identity(IdentityMetadata {
            meshnet: Some("Home".into()),
            id: Some(7),
            ..Default::default()
        });
    assert_eq!(
        h.router.handle(looped).await,
        RouteOutcome::Dropped(DropReason::Loopback)
    );

    let own = RelayUnit::chat_text(ROOM, "$own", "@relay:example.org", "status");
    assert_eq!(h.router.handle(own).await, RouteOutcome::Dropped(DropReason::OwnMessage));

    settle().await;
    assert!(h.radio.sent().is_empty());
}

#[tokio::test]
async fn test_loopback_survives_malformed_metadata() {
    let h = harness(config("", INTERACTIONS)).await;
    // Another relay echoing our mesh, with some fields it got wrong
    let event = meshrelay_matrix::RoomEvent {
        event_id: "$echo".into(),
        sender: "@otherrelay:example.org".into(),
        kind: "m.room.message".into(),
        content: serde_json::json!({
            "msgtype": "m.text",
            "body": "ALI[Home]: hi",
            "meshtastic_meshnet": "Home",
            "meshtastic_emote": 1,
            "meshtastic_id": "not-a-number",
        }),
    };
    let unit = meshrelay_matrix::normalize_event(ROOM, &event).unwrap();

    assert_eq!(
        h.router.handle(unit).await,
        RouteOutcome::Dropped(DropReason::Loopback)
    );
    settle().await;
    assert!(h.radio.sent().is_empty());
    assert_eq!(h.store.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_remote_mesh_reformatted() {
    let h = harness(config("", "")).await;
    let remote = RelayUnit::chat_text(ROOM, "$remote", "@relay:other.org", "BOB[RemoteMesh]: hi")
        .with_identity(IdentityMetadata {
            longname: Some("Bob Node".into()),
            shortname: Some("BOB".into()),
            meshnet: Some("RemoteMesh".into()),
            text: Some("hi".into()),
            id: Some(9),
            ..Default::default()
        });
    h.router.handle(remote).await;

    eventually(|| h.radio.sent().len() == 1).await;
    assert_eq!(h.radio.texts(), vec!["BOB/Remo: hi"]);
}

#[tokio::test]
async fn test_remote_reaction_emote_relayed_with_tag() {
    let h = harness(config("", INTERACTIONS)).await;
    let remote = RelayUnit::chat_text(
        ROOM,
        "$remote-react",
        "@relay:other.org",
        "[Bob Node/RemoteMesh] reacted 👍 to \"hello\"",
    )
    .with_identity(IdentityMetadata {
        shortname: Some("BOB".into()),
        meshnet: Some("RemoteMesh".into()),
        emote: Some(true),
        reply_id: Some(3),
        ..Default::default()
    });
    h.router.handle(remote).await;

    eventually(|| h.radio.sent().len() == 1).await;
    assert_eq!(h.radio.texts(), vec!["BOB/Remo reacted 👍 to \"hello\""]);
    settle().await;
    assert_eq!(h.store.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_broadcast_disabled_never_reaches_store() {
    let h = harness(config("broadcast_enabled = false", INTERACTIONS)).await;
    h.store.put(&mapping(42, "$orig", "question")).await.unwrap();

    let reply = RelayUnit::chat_text(ROOM, "$ev", "@alice:example.org", "answer")
        .with_linkage(Linkage::Reply(LinkId::Chat("$orig".into())));
    assert_eq!(
        h.router.handle(reply).await,
        RouteOutcome::Dropped(DropReason::BroadcastDisabled)
    );
    settle().await;
    assert!(h.radio.sent().is_empty());
    assert_eq!(h.store.len().await.unwrap(), 1);
}

#[tokio::test]
async fn test_long_chat_text_truncated_for_radio() {
    let h = harness(config("", "")).await;
    let long = "é".repeat(200);
    h.router
        .handle(RelayUnit::chat_text(ROOM, "$long", "@alice:example.org", long))
        .await;

    eventually(|| h.radio.sent().len() == 1).await;
    let text = &h.radio.texts()[0];
    assert!(text.len() <= RADIO_TEXT_LIMIT);
    assert!(text.starts_with("Alice[M]: é"));
}

// ------------------------------------------------------------------- plugins

struct ConsumeChat;

#[async_trait]
impl PluginHost for ConsumeChat {
    async fn on_chat_message(&self, _room_id: &str, unit: &RelayUnit) -> bool {
        unit.text.starts_with("!ping")
    }
}

struct StuckPlugin;

#[async_trait]
impl PluginHost for StuckPlugin {
    async fn on_radio_message(&self, _unit: &RelayUnit, _long: &str, _mesh: &str) -> bool {
        tokio::time::sleep(Duration::from_secs(5)).await;
        false
    }
}

#[tokio::test]
async fn test_plugin_consumes_command() {
    let h = harness(config("", "")).await;
    let router = h.router.with_plugins(Arc::new(ConsumeChat));

    let ping = RelayUnit::chat_text(ROOM, "$ping", "@alice:example.org", "!ping");
    assert_eq!(router.handle(ping).await, RouteOutcome::PluginHandled);
    let chatter = RelayUnit::chat_text(ROOM, "$chat", "@alice:example.org", "hello");
    assert!(matches!(router.handle(chatter).await, RouteOutcome::Relayed { .. }));

    eventually(|| h.radio.sent().len() == 1).await;
    assert_eq!(h.radio.texts(), vec!["Alice[M]: hello"]);
}

#[tokio::test]
async fn test_plugin_timeout_suppresses_relay() {
    let h = harness(config("plugin_timeout = \"50ms\"", "")).await;
    let router = h.router.with_plugins(Arc::new(StuckPlugin));

    let unit = RelayUnit::radio_text(1, ALICE_NODE, BROADCAST_ADDR, 0, "hello");
    assert_eq!(router.handle(unit).await, RouteOutcome::PluginHandled);
    settle().await;
    assert!(h.chat.sent().is_empty());
}

// ------------------------------------------------------------------- service

#[tokio::test]
async fn test_service_routes_queued_units_once() {
    let h = harness(config("", "[message_interactions]\nreactions = true")).await;
    let (service, handle) = RelayService::new(h.router);
    let task = tokio::spawn(service.run());

    let unit = RelayUnit::radio_text(42, ALICE_NODE, BROADCAST_ADDR, 0, "hello");
    assert!(handle.on_inbound_radio_packet(unit.clone()));
    assert!(handle.on_inbound_radio_packet(unit));
    assert!(handle.on_inbound_chat_event(RelayUnit::chat_text(
        ROOM,
        "$ev",
        "@alice:example.org",
        "hi"
    )));

    rows_eventually(&h.store, 2).await;
    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.radio_units, 2);
    assert_eq!(stats.chat_units, 1);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.relayed, 2);
    assert_eq!(h.chat.sent().len(), 1);
    assert_eq!(h.radio.sent().len(), 1);

    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_service_attached_queue_and_direct_calls() {
    let h = harness(config("", INTERACTIONS)).await;
    let (mut service, handle) = RelayService::new(h.router);
    let (supervisor_tx, supervisor_rx) = tokio::sync::mpsc::channel(8);
    service.attach_radio(supervisor_rx);
    let task = tokio::spawn(service.run());

    supervisor_tx
        .send(RelayUnit::radio_text(7, ALICE_NODE, BROADCAST_ADDR, 0, "from supervisor"))
        .await
        .unwrap();
    eventually(|| h.chat.sent().len() == 1).await;

    let packet_id = handle.send("direct", 0).await.unwrap();
    assert_eq!(h.radio.sent().last().map(|(id, _)| *id), Some(packet_id));

    let identity = IdentityMetadata {
        id: Some(99),
        text: Some("radio words".into()),
        ..Default::default()
    };
    let event_id = handle.relay(ROOM, "relayed words", Some(identity)).await.unwrap();
    let row = h.store.get_by_chat_event_id(&event_id).await.unwrap().unwrap();
    assert_eq!(row.radio_id, 99);
    assert_eq!(row.text, "radio words");
    assert_eq!(row.meshnet, "Home");

    h.radio.set_offline(true);
    assert!(handle.send("lost", 0).await.is_err());

    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
    assert!(handle.stats().await.is_err());
}
