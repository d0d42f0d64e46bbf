use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::context::summary::summary_message;

fn ts(minutes: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp(1_700_000_000 + minutes * 60, 0).unwrap()
}

async fn new_db_with_conversation(id: &str) -> Sqlite {
    let db = Sqlite::new(None).await.unwrap();
    let conversation = Conversation::default()
        .with_id(id)
        .with_title("Street lighting feedback")
        .with_created_at(ts(0));
    db.upsert_conversation(conversation).await.unwrap();
    db
}

fn fake_messages(conversation_id: &str) -> Vec<Message> {
    vec![
        Message::new_user("The light on 5th Ave is out")
            .with_id("msg1")
            .with_conversation_id(conversation_id)
            .with_created_at(ts(1))
            .with_token_count(7),
        Message::new_assistant("Thanks, I filed a repair request")
            .with_id("msg2")
            .with_conversation_id(conversation_id)
            .with_created_at(ts(2))
            .with_token_count(8),
        Message::new_user("How long will it take?")
            .with_id("msg3")
            .with_conversation_id(conversation_id)
            .with_created_at(ts(3))
            .with_token_count(6),
    ]
}

#[tokio::test]
async fn test_upsert_conversation() {
    let db = new_db_with_conversation("test_id").await;

    let actual = db.get_conversation("test_id").await.unwrap();
    assert!(actual.is_some());

    let actual = actual.unwrap();
    assert_eq!(actual.id(), "test_id");
    assert_eq!(actual.title(), "Street lighting feedback");
    assert_eq!(actual.token_usage(), 0);
    assert_eq!(actual.created_at(), ts(0));

    let updated = Conversation::default()
        .with_id("test_id")
        .with_title("Updated Title")
        .with_created_at(ts(0))
        .with_token_usage(999);
    db.upsert_conversation(updated).await.unwrap();

    let actual = db.get_conversation("test_id").await.unwrap().unwrap();
    assert_eq!(actual.title(), "Updated Title");
    // token usage belongs to the store
    assert_eq!(actual.token_usage(), 0);
}

#[tokio::test]
async fn test_get_conversation_not_exist() {
    let db = Sqlite::new(None).await.unwrap();
    let actual = db.get_conversation("non_existent_id").await.unwrap();
    assert!(actual.is_none());
}

#[tokio::test]
async fn test_get_conversations() {
    let db = Sqlite::new(None).await.unwrap();
    for i in 0..3 {
        let conversation = Conversation::default()
            .with_id(format!("test_id_{}", i))
            .with_title(format!("Conversation {}", i))
            .with_created_at(ts(i));
        db.upsert_conversation(conversation).await.unwrap();
    }

    let actual = db.get_conversations().await.unwrap();
    let ids = actual.iter().map(|c| c.id()).collect::<Vec<_>>();
    assert_eq!(ids, vec!["test_id_2", "test_id_1", "test_id_0"]);
}

#[tokio::test]
async fn test_add_messages() {
    let db = new_db_with_conversation("test_id").await;

    db.add_messages("test_id", &fake_messages("test_id"))
        .await
        .unwrap();

    let actual = db.get_messages("test_id").await.unwrap();
    assert_eq!(actual.len(), 3);
    assert_eq!(actual[0].id(), "msg1");
    assert_eq!(actual[0].role(), Role::User);
    assert_eq!(actual[0].content(), "The light on 5th Ave is out");
    assert_eq!(actual[0].token_count(), 7);
    assert_eq!(actual[0].created_at(), ts(1));
    assert_eq!(actual[0].conversation_id(), "test_id");
    assert_eq!(actual[1].role(), Role::Assistant);
    assert_eq!(actual[2].id(), "msg3");

    let conversation = db.get_conversation("test_id").await.unwrap().unwrap();
    assert_eq!(conversation.token_usage(), 21);
}

#[tokio::test]
async fn test_add_messages_unknown_conversation() {
    let db = Sqlite::new(None).await.unwrap();

    let err = db
        .add_messages("missing", &fake_messages("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetError::InvalidConversation(id) if id == "missing"));
    assert!(db.get_messages("missing").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_get_messages_orders_by_creation() {
    let db = new_db_with_conversation("test_id").await;

    let mut messages = fake_messages("test_id");
    messages.reverse();
    db.add_messages("test_id", &messages).await.unwrap();
    db.add_messages(
        "test_id",
        &[Message::new_user("same minute as msg3")
            .with_id("msg4")
            .with_created_at(ts(3))],
    )
    .await
    .unwrap();

    let ids = db
        .get_messages("test_id")
        .await
        .unwrap()
        .iter()
        .map(|msg| msg.id().to_string())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["msg1", "msg2", "msg3", "msg4"]);
}

#[tokio::test]
async fn test_delete_messages() {
    let db = new_db_with_conversation("test_id").await;
    db.add_messages("test_id", &fake_messages("test_id"))
        .await
        .unwrap();

    let deleted = db
        .delete_messages(
            "test_id",
            &["msg1".to_string(), "unknown".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(deleted, 1);

    let actual = db.get_messages("test_id").await.unwrap();
    assert_eq!(actual.len(), 2);
    assert_eq!(actual[0].id(), "msg2");

    let conversation = db.get_conversation("test_id").await.unwrap().unwrap();
    assert_eq!(conversation.token_usage(), 14);
}

#[tokio::test]
async fn test_replace_with_summary() {
    let db = new_db_with_conversation("test_id").await;
    db.add_messages("test_id", &fake_messages("test_id"))
        .await
        .unwrap();

    let summary = summary_message("test_id", "User discussed: light...", 2, ts(2))
        .with_id("summary1");
    db.replace_with_summary(
        "test_id",
        summary.clone(),
        &["msg1".to_string(), "msg2".to_string()],
        None,
    )
    .await
    .unwrap();

    let actual = db.get_messages("test_id").await.unwrap();
    assert_eq!(actual.len(), 2);
    assert_eq!(actual[0].id(), "summary1");
    assert!(actual[0].is_summary());
    assert_eq!(actual[0].original_message_count(), Some(2));
    assert_eq!(actual[0].content(), summary.content());
    assert_eq!(actual[1].id(), "msg3");

    let conversation = db.get_conversation("test_id").await.unwrap().unwrap();
    assert_eq!(conversation.token_usage(), 6 + summary.token_count());
}

#[tokio::test]
async fn test_replace_with_summary_missing_message_rolls_back() {
    let db = new_db_with_conversation("test_id").await;
    db.add_messages("test_id", &fake_messages("test_id"))
        .await
        .unwrap();

    let summary = summary_message("test_id", "User discussed: light...", 2, ts(2));
    let err = db
        .replace_with_summary(
            "test_id",
            summary,
            &["msg1".to_string(), "gone".to_string()],
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetError::Conflict { ref message_id, .. } if message_id == "gone"));

    let actual = db.get_messages("test_id").await.unwrap();
    let ids = actual.iter().map(|msg| msg.id()).collect::<Vec<_>>();
    assert_eq!(ids, vec!["msg1", "msg2", "msg3"]);
    assert!(actual.iter().all(|msg| !msg.is_summary()));

    let conversation = db.get_conversation("test_id").await.unwrap().unwrap();
    assert_eq!(conversation.token_usage(), 21);
}

#[tokio::test]
async fn test_recalculate_token_usage() {
    let db = new_db_with_conversation("test_id").await;
    db.add_messages("test_id", &fake_messages("test_id"))
        .await
        .unwrap();

    let usage = db.recalculate_token_usage("test_id").await.unwrap();
    assert_eq!(usage, 21);

    let err = db.recalculate_token_usage("missing").await.unwrap_err();
    assert!(matches!(err, BudgetError::InvalidConversation(_)));
}

#[tokio::test]
async fn test_delete_conversation_cascades() {
    let db = new_db_with_conversation("test_id").await;
    db.add_messages("test_id", &fake_messages("test_id"))
        .await
        .unwrap();

    db.delete_conversation("test_id").await.unwrap();
    assert!(db.get_conversation("test_id").await.unwrap().is_none());
    assert!(db.get_messages("test_id").await.unwrap().is_empty());
}

async fn assert_untouched(db: &Sqlite) {
    let actual = db.get_messages("test_id").await.unwrap();
    let ids = actual.iter().map(|msg| msg.id()).collect::<Vec<_>>();
    assert_eq!(ids, vec!["msg1", "msg2", "msg3"]);

    let conversation = db.get_conversation("test_id").await.unwrap().unwrap();
    assert_eq!(conversation.token_usage(), 21);
}

#[tokio::test]
async fn test_replace_with_summary_expired_deadline() {
    let db = new_db_with_conversation("test_id").await;
    db.add_messages("test_id", &fake_messages("test_id"))
        .await
        .unwrap();

    let summary = summary_message("test_id", "User discussed: light...", 2, ts(2));
    let err = db
        .replace_with_summary(
            "test_id",
            summary,
            &["msg1".to_string(), "msg2".to_string()],
            Some(Instant::now()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetError::StoreUnavailable(_)));
    assert_untouched(&db).await;
}

#[tokio::test]
async fn test_replace_with_summary_busy_store_misses_deadline() {
    let db = Arc::new(new_db_with_conversation("test_id").await);
    db.add_messages("test_id", &fake_messages("test_id"))
        .await
        .unwrap();

    // hold the connection past the deadline
    let busy = Arc::clone(&db);
    let stall = tokio::spawn(async move {
        busy.conn
            .call(|_| {
                std::thread::sleep(Duration::from_millis(1500));
                Ok::<_, tokio_rusqlite::Error>(())
            })
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let summary = summary_message("test_id", "User discussed: light...", 2, ts(2));
    let err = db
        .replace_with_summary(
            "test_id",
            summary,
            &["msg1".to_string(), "msg2".to_string()],
            Some(Instant::now() + Duration::from_secs(1)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetError::StoreUnavailable(_)));

    stall.await.unwrap().unwrap();
    assert_untouched(&db).await;
}
