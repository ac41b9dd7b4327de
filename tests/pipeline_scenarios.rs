mod common;

use common::{TestHub, ADMIN_WXID, BOT_WXID};
use serde_json::json;
use wxhub_server::pipeline::PipelineOutcome;
use wxhub_server::storage::ConversationMessageRecord;

#[tokio::test]
async fn noise_and_unknown_sessions_are_dropped() {
    let hub = TestHub::new();
    assert_eq!(
        hub.send("revoke", 1, json!({"msgid": "n1"})).await,
        PipelineOutcome::Noise
    );
    assert_eq!(
        hub.send("text", 1, json!({"msgid": "n2", "from_wxid": "wxid_a", "msg": "hi"}))
            .await,
        PipelineOutcome::UnknownBot
    );
    assert!(hub.sink.events().is_empty());
}

#[tokio::test]
async fn image_event_becomes_linked_text() {
    let hub = TestHub::new();
    hub.login().await;
    let outcome = hub
        .send(
            "image",
            1,
            json!({
                "msgid": "img-1",
                "from_wxid": "wxid_a",
                "to_wxid": BOT_WXID,
                "image": "C:\\path\\img.dat",
                "raw_msg": "<img md5=\"abc\" hdwidth=\"100\" hdheight=\"200\" hdlength=\"2097152\"/>"
            }),
        )
        .await;
    assert_eq!(outcome, PipelineOutcome::Forwarded);
    let events = hub.sink.events();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.event_type, "text");
    assert_eq!(event.origin_type.as_deref(), Some("image"));
    assert!(event.content.starts_with("[image] https://media.example.com/wx/pc-1/"));
    assert!(event.content.ends_with(" (100x200) 2M"));
    assert_eq!(hub.agent.count("decrypt_image"), 1);
}

#[tokio::test]
async fn group_rename_updates_room_name() {
    let mut config = common::test_config();
    config
        .pipeline
        .feature_defaults
        .insert("room_listen".to_string(), true);
    let hub = TestHub::with_config(config);
    hub.login().await;
    hub.send(
        "system_notice",
        1,
        json!({
            "room_wxid": "study@chatroom",
            "raw_msg": "\"Alice\" changed the group name to \"Study Group\""
        }),
    )
    .await;
    let room = hub
        .storage
        .get_room(BOT_WXID, "study@chatroom")
        .unwrap()
        .expect("room stored");
    assert_eq!(room.display_name.as_deref(), Some("Study Group"));
    let events = hub.sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].content,
        "[system] Alice changed the group name to \"Study Group\""
    );
}

#[tokio::test]
async fn room_config_command_bypasses_gate_and_opens_room() {
    let hub = TestHub::new();
    hub.login().await;
    let room_text = |msgid: &str, room: &str, from: &str, msg: &str| {
        json!({"msgid": msgid, "room_wxid": room, "from_wxid": from, "to_wxid": BOT_WXID, "msg": msg})
    };

    // 未配置的群：普通消息被闸门拦下。
    let outcome = hub
        .send("text", 1, room_text("r0", "a@chatroom", "wxid_a", "hello"))
        .await;
    assert_eq!(outcome, PipelineOutcome::Terminal("room_gate"));

    let outcome = hub
        .send(
            "text",
            1,
            room_text("r1", "a@chatroom", ADMIN_WXID, "/config room_listen 1"),
        )
        .await;
    assert_eq!(outcome, PipelineOutcome::Terminal("dispatcher"));
    assert_eq!(
        hub.agent.calls(),
        vec!["send_text a@chatroom room_listen for a@chatroom: on".to_string()]
    );

    let outcome = hub
        .send("text", 1, room_text("r2", "a@chatroom", "wxid_a", "hello"))
        .await;
    assert_eq!(outcome, PipelineOutcome::Forwarded);

    let outcome = hub
        .send("text", 1, room_text("r3", "b@chatroom", "wxid_a", "hello"))
        .await;
    assert_eq!(outcome, PipelineOutcome::Terminal("room_gate"));

    let events = hub.sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].room_wxid.as_deref(), Some("a@chatroom"));
}

#[tokio::test]
async fn muted_room_still_records_roster_changes() {
    let hub = TestHub::new();
    hub.login().await;
    hub.storage
        .insert_conversation_message(&ConversationMessageRecord {
            bot_wxid: BOT_WXID.to_string(),
            room_wxid: Some("quiet@chatroom".to_string()),
            peer_wxid: "quiet@chatroom".to_string(),
            sender_wxid: "wxid_a".to_string(),
            event_id: Some("old".to_string()),
            origin_type: None,
            content: "earlier".to_string(),
            created_at: 1.0,
        })
        .unwrap();

    let outcome = hub
        .send(
            "system_notice",
            1,
            json!({
                "room_wxid": "quiet@chatroom",
                "raw_msg": "\"Alice\" changed the group name to \"Quiet Corner\""
            }),
        )
        .await;
    assert_eq!(outcome, PipelineOutcome::Terminal("room_gate"));
    let room = hub
        .storage
        .get_room(BOT_WXID, "quiet@chatroom")
        .unwrap()
        .expect("room stored");
    assert_eq!(room.display_name.as_deref(), Some("Quiet Corner"));

    let outcome = hub
        .send(
            "room_member_del",
            1,
            json!({"room_wxid": "quiet@chatroom", "member_wxid": BOT_WXID}),
        )
        .await;
    assert_eq!(outcome, PipelineOutcome::Terminal("room_gate"));
    assert!(hub
        .storage
        .list_conversation_messages(BOT_WXID, "quiet@chatroom", 10)
        .unwrap()
        .is_empty());
    assert!(hub.sink.events().is_empty());
    assert_eq!(hub.agent.count("send_text"), 0);
}

#[tokio::test]
async fn config_command_from_non_operator_is_silent() {
    let hub = TestHub::new();
    hub.login().await;
    let outcome = hub
        .send(
            "text",
            1,
            json!({"msgid": "c1", "room_wxid": "a@chatroom", "from_wxid": "wxid_a", "msg": "/config room_listen 1"}),
        )
        .await;
    assert_eq!(outcome, PipelineOutcome::Terminal("dispatcher"));
    assert!(hub.agent.calls().is_empty());
    let outcome = hub
        .send(
            "text",
            1,
            json!({"msgid": "c2", "room_wxid": "a@chatroom", "from_wxid": "wxid_a", "msg": "hello"}),
        )
        .await;
    assert_eq!(outcome, PipelineOutcome::Terminal("room_gate"));
}

#[tokio::test]
async fn voice_and_transcript_forward_once() {
    let hub = TestHub::new();
    hub.login().await;
    let outcome = hub
        .send(
            "voice",
            1,
            json!({"msgid": "m1", "from_wxid": "wxid_a", "to_wxid": BOT_WXID, "voice": "C:\\v\\m1.silk"}),
        )
        .await;
    assert_eq!(outcome, PipelineOutcome::Terminal("voice"));
    assert!(hub.sink.events().is_empty());
    assert_eq!(hub.agent.count("transcribe_voice m1"), 1);

    hub.send("voice_transcript", 1, json!({"msgid": "m1", "text": "hi there"}))
        .await;
    let events = hub.sink.events();
    assert_eq!(events.len(), 1);
    assert!(events[0].content.contains("recognized: hi there"));
    assert_eq!(events[0].from_wxid, "wxid_a");
    assert_eq!(events[0].origin_type.as_deref(), Some("voice_transcript"));

    // 同一转写结果重复到达时已无待转写条目。
    hub.send("voice_transcript", 1, json!({"msgid": "m1", "text": "hi there"}))
        .await;
    assert_eq!(hub.sink.events().len(), 1);
}

#[tokio::test]
async fn transcript_without_pending_voice_passes_harmlessly() {
    let hub = TestHub::new();
    hub.login().await;
    let outcome = hub
        .send("voice_transcript", 1, json!({"msgid": "ghost", "text": "boo"}))
        .await;
    assert_eq!(outcome, PipelineOutcome::PassedThrough);
    assert!(hub.sink.events().is_empty());
}

#[tokio::test]
async fn duplicate_events_reply_and_forward_once() {
    let hub = TestHub::new();
    hub.login().await;
    let help = json!({"msgid": "h1", "from_wxid": "wxid_a", "to_wxid": BOT_WXID, "msg": "/help"});
    hub.send("text", 1, help.clone()).await;
    hub.send("text", 1, help).await;
    assert_eq!(hub.agent.count("send_text wxid_a"), 1);

    let chat = json!({"msgid": "t1", "from_wxid": "wxid_a", "to_wxid": BOT_WXID, "msg": "hello"});
    assert_eq!(hub.send("text", 1, chat.clone()).await, PipelineOutcome::Forwarded);
    assert_eq!(hub.send("text", 1, chat).await, PipelineOutcome::PassedThrough);
    assert_eq!(hub.sink.events().len(), 1);
}

#[tokio::test]
async fn canonical_text_is_not_retagged() {
    let hub = TestHub::new();
    hub.login().await;
    hub.send(
        "text",
        1,
        json!({
            "msgid": "ct1",
            "from_wxid": "wxid_a",
            "to_wxid": BOT_WXID,
            "msg": "[image] https://media.example.com/wx/pc-1/a.jpg",
            "origin_type": "image"
        }),
    )
    .await;
    hub.send(
        "text",
        1,
        json!({"msgid": "ct2", "from_wxid": "wxid_a", "to_wxid": BOT_WXID, "msg": "plain"}),
    )
    .await;
    let events = hub.sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].origin_type.as_deref(), Some("image"));
    assert_eq!(
        events[0].content,
        "[image] https://media.example.com/wx/pc-1/a.jpg"
    );
    assert_eq!(events[1].origin_type, None);
    assert_eq!(events[1].content, "plain");
}

#[tokio::test]
async fn duplicate_login_refreshes_roster_once() {
    let hub = TestHub::new();
    hub.login().await;
    let first = hub
        .storage
        .get_bot_session(BOT_WXID)
        .unwrap()
        .expect("session stored");
    hub.send("login", 1, json!({"wxid": BOT_WXID, "nickname": "Helper 2"}))
        .await;
    let second = hub
        .storage
        .get_bot_session(BOT_WXID)
        .unwrap()
        .expect("session stored");
    assert_eq!(hub.agent.count("refresh_roster"), 1);
    assert_eq!(second.nickname, "Helper 2");
    assert_eq!(second.client_slot, Some(1));
    assert!(second.login_at >= first.login_at);
    assert_eq!(hub.storage.list_bot_sessions().unwrap().len(), 1);
}

#[tokio::test]
async fn heartbeat_for_unknown_bot_is_ignored_and_logout_clears_slot() {
    let hub = TestHub::new();
    assert_eq!(
        hub.send("heartbeat", 3, json!({})).await,
        PipelineOutcome::Lifecycle
    );
    assert!(hub.storage.list_bot_sessions().unwrap().is_empty());

    hub.login().await;
    hub.send("disconnect", 1, json!({})).await;
    assert_eq!(hub.agent.count("respawn_client pc-1#1"), 1);
    assert_eq!(
        hub.send("text", 1, json!({"msgid": "after", "from_wxid": "wxid_a", "msg": "hi"}))
            .await,
        PipelineOutcome::UnknownBot
    );
}
