// Integration tests for Portal Client
//
// These tests drive the session manager, interceptor, account directory and
// chatbot client against a mock backend.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::json;
use std::sync::Arc;

use portal_client::{
    accounts::AccountDirectory,
    auth::{self, InitOutcome, SchedulerState, SessionEvent, SessionManager, LOGIN_ROUTE},
    chatbot::{ChatRole, ChatbotClient, Conversation, WELCOME_MESSAGE},
    error::ClientError,
    http_client::ApiClient,
    interceptor::{InterceptedClient, InterceptorPolicy},
    storage::{LocalStorage, MemoryStorage, TOKEN_KEY, USER_KEY},
};

// ==================================================================================================
// Test Helpers
// ==================================================================================================

struct Harness {
    server: ServerGuard,
    storage: Arc<MemoryStorage>,
    api: Arc<ApiClient>,
    session: Arc<SessionManager>,
}

async fn harness() -> Harness {
    let server = Server::new_async().await;
    let storage = Arc::new(MemoryStorage::new());
    let api = Arc::new(ApiClient::new(&server.url(), 5, 5, 0).expect("Failed to create HTTP client"));
    let http = Arc::new(InterceptedClient::new(
        api.clone(),
        InterceptorPolicy::default(),
        storage.clone(),
    ));
    let session = SessionManager::new(http, storage.clone(), 60);

    Harness {
        server,
        storage,
        api,
        session,
    }
}

/// Unsigned credential expiring `secs` from now
fn token_expiring_in(secs: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = json!({"sub": "1", "exp": Utc::now().timestamp() + secs});
    let body = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.sig", header, body)
}

fn account_body(token: &str) -> String {
    json!({
        "AccountId": 1,
        "email": "a@b.com",
        "firstName": "Ada",
        "lastName": "Lovelace",
        "role": "User",
        "jwtToken": token
    })
    .to_string()
}

async fn mock_login(server: &mut ServerGuard, token: &str) -> Mock {
    server
        .mock("POST", "/accounts/authenticate")
        .match_body(Matcher::Json(json!({"email": "a@b.com", "password": "x"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_header("set-cookie", "refreshToken=rt-1; HttpOnly; Path=/")
        .with_body(account_body(token))
        .create_async()
        .await
}

async fn wait_until_matched(mock: &Mock) -> bool {
    for _ in 0..50 {
        if mock.matched_async().await {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    false
}

fn refresh_at(session: &SessionManager) -> chrono::DateTime<Utc> {
    match session.scheduled_refresh() {
        SchedulerState::Scheduled { refresh_at } => refresh_at,
        SchedulerState::Idle => panic!("expected a scheduled refresh"),
    }
}

// ==================================================================================================
// Session Lifecycle Tests
// ==================================================================================================

#[tokio::test]
async fn test_login_schedules_refresh_a_minute_before_expiry() {
    let mut h = harness().await;
    let _login = mock_login(&mut h.server, &token_expiring_in(3600)).await;

    let before = Utc::now();
    let account = h.session.login("a@b.com", "x").await.unwrap();

    assert_eq!(account.id, "1");
    assert_eq!(h.session.current_identity().unwrap().email, "a@b.com");

    let expected = before + Duration::seconds(3540);
    assert!((refresh_at(&h.session) - expected).num_seconds().abs() <= 2);
}

#[tokio::test]
async fn test_login_then_failed_refresh_clears_session() {
    let mut h = harness().await;
    let _login = mock_login(&mut h.server, &token_expiring_in(3600)).await;
    let _refresh = h
        .server
        .mock("POST", "/accounts/refresh-token")
        .with_status(401)
        .create_async()
        .await;
    let revoke = h
        .server
        .mock("POST", "/accounts/revoke-token")
        .expect(0)
        .create_async()
        .await;

    h.session.login("a@b.com", "x").await.unwrap();
    let mut events = h.session.events();

    let err = h.session.refresh_token().await.unwrap_err();

    assert!(matches!(err, ClientError::RefreshFailure));
    assert!(h.session.current_identity().is_none());
    assert_eq!(h.session.scheduled_refresh(), SchedulerState::Idle);
    assert!(h.storage.get(TOKEN_KEY).is_none());
    assert!(h.storage.get(USER_KEY).is_none());
    assert!(h.api.cookies().is_empty());
    assert_eq!(events.recv().await.unwrap(), SessionEvent::Expired);
    revoke.assert_async().await;
}

#[tokio::test]
async fn test_refresh_server_error_still_clears_session() {
    let mut h = harness().await;
    let _login = mock_login(&mut h.server, &token_expiring_in(3600)).await;
    let _refresh = h
        .server
        .mock("POST", "/accounts/refresh-token")
        .with_status(500)
        .with_body(r#"{"message": "database unavailable"}"#)
        .create_async()
        .await;

    h.session.login("a@b.com", "x").await.unwrap();
    let err = h.session.refresh_token().await.unwrap_err();

    assert_eq!(err.status(), Some(500));
    assert_eq!(err.user_message(), "database unavailable");
    assert!(h.session.current_identity().is_none());
    assert_eq!(h.session.scheduled_refresh(), SchedulerState::Idle);
}

#[tokio::test]
async fn test_refresh_replaces_the_pending_timer() {
    let mut h = harness().await;
    let _login = mock_login(&mut h.server, &token_expiring_in(600)).await;
    let renewed = token_expiring_in(7200);
    let _refresh = h
        .server
        .mock("POST", "/accounts/refresh-token")
        .match_header("cookie", Matcher::Regex("refreshToken=rt-1".to_string()))
        .with_status(200)
        .with_header("set-cookie", "refreshToken=rt-2; HttpOnly; Path=/")
        .with_body(account_body(&renewed))
        .expect(1)
        .create_async()
        .await;

    h.session.login("a@b.com", "x").await.unwrap();
    let first = refresh_at(&h.session);

    let account = h.session.refresh_token().await.unwrap();
    let second = refresh_at(&h.session);

    assert_eq!(account.jwt_token.as_deref(), Some(renewed.as_str()));
    assert!(second - first > Duration::seconds(6000));
    assert_eq!(h.api.cookies().get("refreshToken").as_deref(), Some("rt-2"));
    assert_eq!(h.storage.get(TOKEN_KEY).as_deref(), Some(renewed.as_str()));
}

#[tokio::test]
async fn test_refresh_without_session_fails_locally() {
    let mut h = harness().await;
    let refresh = h
        .server
        .mock("POST", "/accounts/refresh-token")
        .expect(0)
        .create_async()
        .await;

    let err = h.session.refresh_token().await.unwrap_err();

    assert!(matches!(err, ClientError::NoActiveSession));
    refresh.assert_async().await;
}

#[tokio::test]
async fn test_token_inside_lead_window_is_not_scheduled() {
    let mut h = harness().await;
    let _login = mock_login(&mut h.server, &token_expiring_in(30)).await;

    h.session.login("a@b.com", "x").await.unwrap();

    assert!(h.session.current_identity().is_some());
    assert_eq!(h.session.scheduled_refresh(), SchedulerState::Idle);
}

#[tokio::test]
async fn test_malformed_token_keeps_session_without_timer() {
    let mut h = harness().await;
    let _login = mock_login(&mut h.server, "definitely-not-a-jwt").await;

    let account = h.session.login("a@b.com", "x").await.unwrap();

    assert_eq!(account.jwt_token.as_deref(), Some("definitely-not-a-jwt"));
    assert_eq!(h.session.scheduled_refresh(), SchedulerState::Idle);
}

#[tokio::test]
async fn test_failed_login_surfaces_backend_message() {
    let mut h = harness().await;
    let _login = h
        .server
        .mock("POST", "/accounts/authenticate")
        .with_status(400)
        .with_body(r#"{"message": "Email or password is incorrect"}"#)
        .create_async()
        .await;

    let err = h.session.login("a@b.com", "x").await.unwrap_err();

    assert_eq!(err.user_message(), "Email or password is incorrect");
    assert!(h.session.current_identity().is_none());
}

#[tokio::test]
async fn test_logout_revokes_in_background() {
    let mut h = harness().await;
    let _login = mock_login(&mut h.server, &token_expiring_in(3600)).await;
    let revoke = h
        .server
        .mock("POST", "/accounts/revoke-token")
        .match_header("cookie", Matcher::Regex("refreshToken=rt-1".to_string()))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    h.session.login("a@b.com", "x").await.unwrap();
    let mut events = h.session.events();

    h.session.logout();

    assert!(h.session.current_identity().is_none());
    assert_eq!(h.session.scheduled_refresh(), SchedulerState::Idle);
    assert_eq!(
        events.recv().await.unwrap(),
        SessionEvent::LoggedOut {
            redirect_to: LOGIN_ROUTE
        }
    );
    assert!(wait_until_matched(&revoke).await);
}

// ==================================================================================================
// Interceptor Tests
// ==================================================================================================

#[tokio::test]
async fn test_unauthorized_protected_call_logs_out_once() {
    let mut h = harness().await;
    let _login = mock_login(&mut h.server, &token_expiring_in(3600)).await;
    let _accounts = h
        .server
        .mock("GET", "/accounts")
        .with_status(401)
        .with_body(r#"{"message": "Unauthorized"}"#)
        .create_async()
        .await;
    let revoke = h
        .server
        .mock("POST", "/accounts/revoke-token")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    h.session.login("a@b.com", "x").await.unwrap();
    let mut events = h.session.events();

    let err = AccountDirectory::new(h.session.clone())
        .get_all()
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::AuthFailure { status: 401, .. }));
    assert!(h.session.current_identity().is_none());
    assert_eq!(
        events.recv().await.unwrap(),
        SessionEvent::LoggedOut {
            redirect_to: LOGIN_ROUTE
        }
    );
    assert!(events.try_recv().is_err());
    assert!(wait_until_matched(&revoke).await);
    revoke.assert_async().await;
}

#[tokio::test]
async fn test_forbidden_without_session_does_not_logout() {
    let mut h = harness().await;
    let _accounts = h
        .server
        .mock("GET", "/accounts/5")
        .with_status(403)
        .create_async()
        .await;
    let revoke = h
        .server
        .mock("POST", "/accounts/revoke-token")
        .expect(0)
        .create_async()
        .await;

    let err = AccountDirectory::new(h.session.clone())
        .get_by_id("5")
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::Request { status: 403, .. }));
    assert_eq!(err.user_message(), "Forbidden");
    revoke.assert_async().await;
}

#[tokio::test]
async fn test_unauthorized_chatbot_call_keeps_session() {
    let mut h = harness().await;
    let _login = mock_login(&mut h.server, &token_expiring_in(3600)).await;
    let _chat = h
        .server
        .mock("POST", "/chatbot/message")
        .with_status(401)
        .with_body(r#"{"message": "Assistant unavailable"}"#)
        .create_async()
        .await;
    let revoke = h
        .server
        .mock("POST", "/accounts/revoke-token")
        .expect(0)
        .create_async()
        .await;

    h.session.login("a@b.com", "x").await.unwrap();

    let err = ChatbotClient::new(h.session.clone())
        .send_message("hello", None)
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::Request { status: 401, .. }));
    assert_eq!(err.user_message(), "Assistant unavailable");
    assert!(h.session.current_identity().is_some());
    assert!(matches!(
        h.session.scheduled_refresh(),
        SchedulerState::Scheduled { .. }
    ));
    revoke.assert_async().await;
}

// ==================================================================================================
// Startup Tests
// ==================================================================================================

#[tokio::test]
async fn test_initializer_refreshes_restored_session() {
    let mut server = Server::new_async().await;
    let renewed = token_expiring_in(900);
    let refresh = server
        .mock("POST", "/accounts/refresh-token")
        .with_status(200)
        .with_body(account_body(&renewed))
        .expect(1)
        .create_async()
        .await;

    let storage = Arc::new(MemoryStorage::new());
    storage
        .set(USER_KEY, &account_body(&token_expiring_in(-100)))
        .unwrap();

    let api = Arc::new(ApiClient::new(&server.url(), 5, 5, 0).unwrap());
    let http = Arc::new(InterceptedClient::new(
        api,
        InterceptorPolicy::default(),
        storage.clone(),
    ));
    let session = SessionManager::new(http, storage.clone(), 60);

    assert_eq!(auth::initialize(&session).await, InitOutcome::Refreshed);
    assert_eq!(
        session.current_identity().unwrap().jwt_token.as_deref(),
        Some(renewed.as_str())
    );
    refresh.assert_async().await;
}

// ==================================================================================================
// Account Directory Tests
// ==================================================================================================

#[tokio::test]
async fn test_update_current_account_republishes_merged_identity() {
    let mut h = harness().await;
    let token = token_expiring_in(3600);
    let _login = mock_login(&mut h.server, &token).await;
    let _update = h
        .server
        .mock("PUT", "/accounts/1")
        .match_body(Matcher::PartialJson(json!({"firstName": "Augusta"})))
        .with_status(200)
        .with_body(r#"{"AccountId": 1, "firstName": "Augusta"}"#)
        .create_async()
        .await;

    h.session.login("a@b.com", "x").await.unwrap();
    let mut watcher = h.session.subscribe();
    let _ = watcher.borrow_and_update();

    AccountDirectory::new(h.session.clone())
        .update("1", json!({"firstName": "Augusta"}))
        .await
        .unwrap();

    assert!(watcher.has_changed().unwrap());
    let current = h.session.current_identity().unwrap();
    assert_eq!(current.first_name.as_deref(), Some("Augusta"));
    assert_eq!(current.last_name.as_deref(), Some("Lovelace"));
    assert_eq!(current.jwt_token.as_deref(), Some(token.as_str()));
}

#[tokio::test]
async fn test_update_other_account_leaves_identity_alone() {
    let mut h = harness().await;
    let _login = mock_login(&mut h.server, &token_expiring_in(3600)).await;
    let _update = h
        .server
        .mock("PUT", "/accounts/2")
        .with_status(200)
        .with_body(r#"{"AccountId": 2, "firstName": "Grace"}"#)
        .create_async()
        .await;

    h.session.login("a@b.com", "x").await.unwrap();

    AccountDirectory::new(h.session.clone())
        .update("2", json!({"firstName": "Grace"}))
        .await
        .unwrap();

    assert_eq!(
        h.session.current_identity().unwrap().first_name.as_deref(),
        Some("Ada")
    );
}

#[tokio::test]
async fn test_deleting_current_account_logs_out() {
    let mut h = harness().await;
    let _login = mock_login(&mut h.server, &token_expiring_in(3600)).await;
    let _delete = h
        .server
        .mock("DELETE", "/accounts/1")
        .with_status(200)
        .create_async()
        .await;
    let _revoke = h
        .server
        .mock("POST", "/accounts/revoke-token")
        .with_status(200)
        .create_async()
        .await;

    h.session.login("a@b.com", "x").await.unwrap();

    AccountDirectory::new(h.session.clone())
        .delete("1")
        .await
        .unwrap();

    assert!(h.session.current_identity().is_none());
}

#[tokio::test]
async fn test_register_posts_camel_case_body() {
    let mut h = harness().await;
    let register = h
        .server
        .mock("POST", "/accounts/register")
        .match_body(Matcher::PartialJson(json!({
            "firstName": "Ada",
            "confirmPassword": "secret",
            "acceptTerms": true
        })))
        .with_status(200)
        .create_async()
        .await;

    let request = auth::RegisterRequest {
        title: "Ms".to_string(),
        first_name: "Ada".to_string(),
        last_name: "Lovelace".to_string(),
        email: "a@b.com".to_string(),
        password: "secret".to_string(),
        confirm_password: "secret".to_string(),
        accept_terms: true,
    };

    AccountDirectory::new(h.session.clone())
        .register(&request)
        .await
        .unwrap();
    register.assert_async().await;
}

// ==================================================================================================
// Chatbot Tests
// ==================================================================================================

#[tokio::test]
async fn test_conversation_round_trip() {
    let mut h = harness().await;
    let token = token_expiring_in(3600);
    let _login = mock_login(&mut h.server, &token).await;
    let _first = h
        .server
        .mock("POST", "/chatbot/message")
        .match_header("authorization", format!("Bearer {}", token).as_str())
        .match_body(Matcher::Json(json!({"message": "hello", "conversationId": null})))
        .with_status(200)
        .with_body(
            r#"{"conversationId": "conv-1", "message": "Hi! How can I help?", "timestamp": "2025-01-12T10:30:00Z"}"#,
        )
        .create_async()
        .await;
    let _second = h
        .server
        .mock("POST", "/chatbot/message")
        .match_body(Matcher::PartialJson(json!({"conversationId": "conv-1"})))
        .with_status(200)
        .with_body(
            r#"{"conversationId": "conv-1", "message": "Sure.", "timestamp": "2025-01-12T10:31:00Z"}"#,
        )
        .create_async()
        .await;

    h.session.login("a@b.com", "x").await.unwrap();

    let mut conversation = Conversation::new(ChatbotClient::new(h.session.clone()));
    conversation.open();
    assert_eq!(conversation.messages()[0].message, WELCOME_MESSAGE);

    let reply = conversation.send("  hello  ").await.unwrap();
    assert_eq!(reply.message, "Hi! How can I help?");
    assert_eq!(conversation.conversation_id(), Some("conv-1"));

    conversation.send("and more?").await.unwrap();
    let roles: Vec<ChatRole> = conversation.messages().iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            ChatRole::Assistant,
            ChatRole::User,
            ChatRole::Assistant,
            ChatRole::User,
            ChatRole::Assistant
        ]
    );
}

#[tokio::test]
async fn test_conversation_rejects_blank_message_without_network() {
    let mut h = harness().await;
    let chat = h
        .server
        .mock("POST", "/chatbot/message")
        .expect(0)
        .create_async()
        .await;

    let mut conversation = Conversation::new(ChatbotClient::new(h.session.clone()));
    let err = conversation.send("   ").await.unwrap_err();

    assert!(matches!(err, ClientError::Validation(_)));
    assert!(conversation.messages().is_empty());
    chat.assert_async().await;
}

#[tokio::test]
async fn test_history_and_clear() {
    let mut h = harness().await;
    let _history = h
        .server
        .mock("GET", "/chatbot/history")
        .match_query(Matcher::UrlEncoded("limit".into(), "50".into()))
        .with_status(200)
        .with_body(
            json!([
                {"chatMessageId": 1, "AccountId": 1, "conversationId": "conv-9", "role": "user", "message": "hi", "timestamp": "2025-01-12T10:30:00Z"},
                {"chatMessageId": 2, "AccountId": 1, "conversationId": "conv-9", "role": "assistant", "message": "hello", "timestamp": "2025-01-12T10:30:05Z"}
            ])
            .to_string(),
        )
        .create_async()
        .await;
    let clear = h
        .server
        .mock("DELETE", "/chatbot/history")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let mut conversation = Conversation::new(ChatbotClient::new(h.session.clone()));
    assert_eq!(conversation.load_history().await.unwrap(), 2);
    assert_eq!(conversation.conversation_id(), Some("conv-9"));

    conversation.clear().await.unwrap();
    assert_eq!(conversation.conversation_id(), None);
    assert_eq!(conversation.messages().len(), 1);
    assert_eq!(conversation.messages()[0].message, WELCOME_MESSAGE);
    clear.assert_async().await;
}
