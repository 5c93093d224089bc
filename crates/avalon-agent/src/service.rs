//! The [`DecisionService`] trait and its HTTP implementation.
//!
//! The trait is the seam between the turn engine and the externally
//! hosted agent manager: the engine only ever talks to `impl
//! DecisionService`, so tests swap in scripted services and never touch
//! the network.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use reqwest::Client;

use avalon_protocol::{AgentId, Message};

use crate::{
    Ack, ActionRequest, ActionResponse, AgentTask, GatewayError, PrivateData, StartupRequest,
    StartupResponse, StateUpdate,
};

/// Retries on transport failure after the first attempt.
const MAX_RETRIES: u32 = 2;

/// Fixed delay between retry attempts.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Per-request timeout. Decision calls sit on top of LLM inference and
/// can legitimately take a while.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Bounds of the randomized pacing delay before each action request.
const JITTER_MIN_MS: u64 = 1_000;
const JITTER_MAX_MS: u64 = 3_000;

/// Bridge to the external decision-making service.
///
/// Every method is bounded: transport failures are retried a fixed
/// number of times with a fixed delay and then surfaced, so a caller is
/// never blocked indefinitely. The caller owns the policy for what a
/// surfaced failure means (fatal for action requests, logged-and-ignored
/// for the push notifications).
pub trait DecisionService: Send + Sync + 'static {
    /// Registers one agent player. Called once per agent seat before
    /// role locking finalizes; failure aborts game creation.
    fn startup(
        &self,
        req: StartupRequest,
    ) -> impl Future<Output = Result<StartupResponse, GatewayError>> + Send;

    /// Asks an agent to pick an action. Preceded by a randomized 1–3 s
    /// pacing delay, then retried on transport failure; exhaustion
    /// propagates to the caller.
    fn request_action(
        &self,
        agent: &AgentId,
        task: AgentTask,
        state: StateUpdate,
    ) -> impl Future<Output = Result<ActionResponse, GatewayError>> + Send;

    /// Fire-and-forget chat notification.
    fn push_message(
        &self,
        agent: &AgentId,
        message: &Message,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;

    /// Fire-and-forget state-delta notification.
    fn push_state(
        &self,
        agent: &AgentId,
        update: &StateUpdate,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;

    /// Delivers an agent's private role data. Must be confirmed before
    /// the game starts.
    fn push_private_data(
        &self,
        agent: &AgentId,
        data: &PrivateData,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;

    /// Best-effort teardown on game end, leave, or disposal.
    fn shutdown(&self, agent: &AgentId) -> impl Future<Output = Result<(), GatewayError>> + Send;
}

/// Runs `op` up to `1 + MAX_RETRIES` times, sleeping [`RETRY_DELAY`]
/// between attempts. Only retries errors marked retryable.
async fn with_retry<T, F, Fut>(op: F) -> Result<T, GatewayError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                attempt += 1;
                tracing::debug!(attempt, error = %e, "decision service call failed, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "decision service call failed, giving up");
                return Err(e);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HttpDecisionService
// ---------------------------------------------------------------------------

/// Default service location, overridable via `AGENT_SERVICE_URL`.
pub const DEFAULT_SERVICE_URL: &str = "http://agentmanager:23003";

/// The production [`DecisionService`]: JSON over HTTP via `reqwest`.
#[derive(Clone)]
pub struct HttpDecisionService {
    client: Client,
    base_url: String,
}

impl HttpDecisionService {
    /// Creates a gateway against the given base URL.
    pub fn new(base_url: &str) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Creates a gateway from `AGENT_SERVICE_URL`, falling back to
    /// [`DEFAULT_SERVICE_URL`].
    pub fn from_env() -> Self {
        let base_url =
            std::env::var("AGENT_SERVICE_URL").unwrap_or_else(|_| DEFAULT_SERVICE_URL.to_string());
        Self::new(&base_url)
    }

    fn agent_url(&self, agent: &AgentId, endpoint: &str) -> String {
        format!("{}/api/agent/{}/{}/", self.base_url, agent, endpoint)
    }

    /// POSTs a JSON body and checks the `success` acknowledgement.
    async fn post_ack<B: serde::Serialize>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<(), GatewayError> {
        let ack: Ack = self
            .client
            .post(url)
            .json(body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if ack.success {
            Ok(())
        } else {
            Err(GatewayError::Rejected(
                ack.message.unwrap_or_else(|| "no reason given".to_string()),
            ))
        }
    }
}

impl Default for HttpDecisionService {
    fn default() -> Self {
        Self::from_env()
    }
}

impl DecisionService for HttpDecisionService {
    async fn startup(&self, req: StartupRequest) -> Result<StartupResponse, GatewayError> {
        let url = format!("{}/api/startup/", self.base_url);
        tracing::info!(game = %req.game_id, role = %req.agent_role_preference, "starting agent");
        with_retry(|| async {
            let resp: StartupResponse = self
                .client
                .get(&url)
                .query(&req)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            if !resp.success {
                Err(GatewayError::Rejected("startup refused".to_string()))
            } else if resp.agent_id.is_none() {
                Err(GatewayError::MissingAgentId)
            } else {
                Ok(resp)
            }
        })
        .await
    }

    async fn request_action(
        &self,
        agent: &AgentId,
        task: AgentTask,
        state: StateUpdate,
    ) -> Result<ActionResponse, GatewayError> {
        // Randomized pacing: emulates human thinking time and keeps a
        // room full of agents from stampeding the service at once.
        let jitter = rand::rng().random_range(JITTER_MIN_MS..=JITTER_MAX_MS);
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        let url = self.agent_url(agent, "action");
        let body = ActionRequest { task, state };
        with_retry(|| async {
            let resp: ActionResponse = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            Ok(resp)
        })
        .await
    }

    async fn push_message(&self, agent: &AgentId, message: &Message) -> Result<(), GatewayError> {
        let url = self.agent_url(agent, "message");
        with_retry(|| self.post_ack(&url, message)).await
    }

    async fn push_state(&self, agent: &AgentId, update: &StateUpdate) -> Result<(), GatewayError> {
        let url = self.agent_url(agent, "state");
        with_retry(|| self.post_ack(&url, update)).await
    }

    async fn push_private_data(
        &self,
        agent: &AgentId,
        data: &PrivateData,
    ) -> Result<(), GatewayError> {
        let url = self.agent_url(agent, "private_data");
        with_retry(|| self.post_ack(&url, data)).await
    }

    async fn shutdown(&self, agent: &AgentId) -> Result<(), GatewayError> {
        let url = self.agent_url(agent, "shutdown");
        tracing::info!(%agent, "shutting down agent");
        with_retry(|| async {
            let ack: Ack = self
                .client
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            if !ack.success {
                tracing::warn!(%agent, reason = ?ack.message, "agent shutdown not confirmed");
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn with_retry_returns_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, GatewayError> = with_retry(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn with_retry_does_not_retry_rejections() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, GatewayError> = with_retry(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(GatewayError::Rejected("nope".into()))
        })
        .await;
        assert!(matches!(result, Err(GatewayError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn with_retry_gives_up_after_budget() {
        // A connect error against a reserved-but-closed port is the
        // cheapest way to manufacture a real retryable reqwest error.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let calls = AtomicU32::new(0);
        let client = Client::new();
        let result: Result<u32, GatewayError> = with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            let client = client.clone();
            async move {
                client
                    .get(format!("http://{addr}/api/startup/"))
                    .send()
                    .await?;
                Ok(0)
            }
        })
        .await;

        assert!(matches!(result, Err(GatewayError::Transport(_))));
        // One initial attempt plus MAX_RETRIES retries.
        assert_eq!(calls.load(Ordering::SeqCst), 1 + MAX_RETRIES);
    }

    #[tokio::test]
    async fn startup_without_agent_id_is_an_error() {
        use std::io::{Read, Write};

        use avalon_protocol::RoomCode;

        // Canned one-shot HTTP server: acknowledges the startup call
        // but never hands out an agent id.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let body = r#"{"success": true}"#;
                let resp = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(resp.as_bytes());
            }
        });

        let svc = HttpDecisionService::new(&format!("http://{addr}"));
        let result = svc
            .startup(StartupRequest {
                game_id: RoomCode("TEST".into()),
                agent_type: "llm".into(),
                agent_role_preference: "random".into(),
                agent_name: "Kira".into(),
            })
            .await;
        assert!(matches!(result, Err(GatewayError::MissingAgentId)));
    }

    #[test]
    fn agent_urls_follow_the_contract() {
        let svc = HttpDecisionService::new("http://localhost:23003/");
        let agent = AgentId("agent-3".into());
        assert_eq!(
            svc.agent_url(&agent, "action"),
            "http://localhost:23003/api/agent/agent-3/action/"
        );
        assert_eq!(
            svc.agent_url(&agent, "shutdown"),
            "http://localhost:23003/api/agent/agent-3/shutdown/"
        );
    }
}
