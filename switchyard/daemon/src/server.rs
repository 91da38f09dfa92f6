//! Line protocol server
//!
//! Reads one JSON request per line from stdin and writes one JSON reply per
//! line to stdout. Every request runs on its own task; a single writer task
//! owns stdout so replies never interleave.
//!
//! ```text
//!   stdin ──lines──► serve() ──spawn──► handle_line ─┐
//!                      │        ──spawn──► handle_line ─┤ mpsc
//!                      │        ──spawn──► handle_line ─┤
//!                      │                                ▼
//!                      │                          writer task ──► stdout
//!                      └─ EOF / shutdown: wait for in-flight requests
//! ```
//!
//! Requests:
//!
//! ```text
//! {"op":"route","text":"summarize this log","context_type":"analysis","model":null,"conversation_id":"c1"}
//! {"op":"feedback","decision_id":"<uuid>","score":0.8}
//! {"op":"explain","decision_id":"<uuid>"}
//! {"op":"stats"}
//! {"op":"suggestions"}
//! ```
//!
//! Any request may carry an `"id"`, echoed back in its reply.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use switchyard_core::{Advisor, DecisionId, FeedbackOutcome, Query, Router};

/// Capacity of the reply channel feeding the writer task
const REPLY_CHANNEL_CAPACITY: usize = 256;

/// One protocol request
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Route {
        text: String,
        #[serde(default)]
        context_type: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        conversation_id: Option<String>,
    },
    Feedback {
        decision_id: String,
        score: f64,
    },
    Explain {
        decision_id: String,
    },
    Stats,
    Suggestions,
}

/// Request plus the caller's correlation id
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(flatten)]
    pub request: Request,
}

fn parse_decision_id(raw: &str) -> Result<DecisionId> {
    raw.parse::<DecisionId>()
        .with_context(|| format!("invalid decision id: {raw}"))
}

/// Execute one request
async fn handle(
    router: &Router,
    advisor: Option<&Advisor>,
    request: Request,
    cancel: &CancellationToken,
) -> Result<Value> {
    match request {
        Request::Route {
            text,
            context_type,
            model,
            conversation_id,
        } => {
            let mut query = Query::new(text);
            query.context_type = context_type;
            query.explicit_model = model;
            query.conversation_id = conversation_id;

            let routed = router.route_with_cancel(query, cancel).await?;
            Ok(json!({
                "decision_id": routed.decision_id.to_string(),
                "model_id": routed.response.model_id,
                "response": routed.response.text,
                "attempts": routed.response.attempts,
                "latency_ms": routed.response.latency.as_millis() as u64,
                "token_usage": routed.response.token_usage,
            }))
        }
        Request::Feedback { decision_id, score } => {
            let id = parse_decision_id(&decision_id)?;
            let reply = match router.submit_feedback(&id, score) {
                FeedbackOutcome::Applied {
                    model_id,
                    satisfaction_avg,
                } => json!({
                    "applied": true,
                    "model_id": model_id,
                    "satisfaction_avg": satisfaction_avg,
                }),
                FeedbackOutcome::UnknownDecision => {
                    json!({ "applied": false, "reason": "unknown decision" })
                }
                FeedbackOutcome::InvalidScore => {
                    json!({ "applied": false, "reason": "invalid score" })
                }
            };
            Ok(reply)
        }
        Request::Explain { decision_id } => {
            let id = parse_decision_id(&decision_id)?;
            let explanation = router.explanation(&id)?;
            Ok(json!({
                "explanation": explanation.render(),
                "details": explanation,
            }))
        }
        Request::Stats => {
            let models: Vec<Value> = router
                .stats()
                .iter()
                .map(|s| {
                    json!({
                        "model_id": s.model_id,
                        "health": s.health,
                        "eligible": s.is_eligible(),
                        "latency_ema_ms": s.latency_ema_ms,
                        "success_rate": s.success_rate,
                        "satisfaction_avg": s.satisfaction_avg,
                        "sample_count": s.sample_count,
                        "in_flight": s.in_flight,
                    })
                })
                .collect();
            Ok(json!({
                "models": models,
                "metrics": router.metrics(),
                "context_nodes": router.graph().len(),
            }))
        }
        Request::Suggestions => {
            let suggestions = advisor.map(Advisor::suggestions).unwrap_or_default();
            Ok(json!({ "suggestions": suggestions }))
        }
    }
}

/// Parse and execute one line, always producing a reply
pub async fn handle_line(
    router: &Router,
    advisor: Option<&Advisor>,
    line: &str,
    cancel: &CancellationToken,
) -> Value {
    let envelope: Envelope = match serde_json::from_str(line) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(error = %e, "Rejected malformed request");
            return json!({ "ok": false, "error": format!("invalid request: {e}") });
        }
    };

    let mut reply = match handle(router, advisor, envelope.request, cancel).await {
        Ok(mut body) => {
            body["ok"] = Value::Bool(true);
            body
        }
        Err(e) => json!({ "ok": false, "error": format!("{e:#}") }),
    };
    if let Some(id) = envelope.id {
        reply["id"] = id;
    }
    reply
}

/// Serve requests from `reader` until EOF or `shutdown`
///
/// `shutdown` stops reading new requests. Requests already accepted are not
/// cancelled; they finish and their replies are written before this returns.
pub async fn serve<R, W>(
    router: Arc<Router>,
    advisor: Option<Arc<Advisor>>,
    reader: R,
    mut writer: W,
    shutdown: CancellationToken,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(REPLY_CHANNEL_CAPACITY);

    let writer_task = tokio::spawn(async move {
        while let Some(line) = reply_rx.recv().await {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut lines = reader.lines();
    let mut tasks = JoinSet::new();
    let mut served = 0_u64;

    loop {
        let line = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                info!("Shutdown requested, no longer reading requests");
                break;
            }
            line = lines.next_line() => line.context("Failed to read request")?,
        };
        let Some(line) = line else {
            info!("Input closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        served += 1;
        let router = Arc::clone(&router);
        let advisor = advisor.clone();
        let reply_tx = reply_tx.clone();
        // shutdown stops reading only; accepted requests run to completion
        let cancel = CancellationToken::new();
        tasks.spawn(async move {
            let reply = handle_line(&router, advisor.as_deref(), &line, &cancel).await;
            if reply_tx.send(reply.to_string()).await.is_err() {
                warn!("Reply writer closed");
            }
        });

        while let Some(done) = tasks.try_join_next() {
            if let Err(e) = done {
                warn!(error = %e, "Request task failed");
            }
        }
    }

    while let Some(done) = tasks.join_next().await {
        if let Err(e) = done {
            warn!(error = %e, "Request task failed");
        }
    }
    drop(reply_tx);
    writer_task
        .await
        .context("Reply writer panicked")?
        .context("Failed to write reply")?;

    info!(requests = served, "Server loop finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use switchyard_core::{
        BackendError, Completion, CompletionBackend, CompletionRequest, ModelDescriptor,
        RouterConfig,
    };

    /// Backend that answers after a fixed delay
    struct Slow(Duration);

    #[async_trait]
    impl CompletionBackend for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, BackendError> {
            tokio::time::sleep(self.0).await;
            Ok(Completion {
                text: "done".to_string(),
                token_usage: None,
            })
        }
    }

    #[test]
    fn test_parse_route_request() {
        let envelope: Envelope = serde_json::from_str(
            r#"{"id":7,"op":"route","text":"summarize this log","context_type":"analysis"}"#,
        )
        .unwrap();
        assert_eq!(envelope.id, Some(json!(7)));
        assert_eq!(
            envelope.request,
            Request::Route {
                text: "summarize this log".to_string(),
                context_type: Some("analysis".to_string()),
                model: None,
                conversation_id: None,
            }
        );
    }

    #[test]
    fn test_parse_simple_ops() {
        let stats: Envelope = serde_json::from_str(r#"{"op":"stats"}"#).unwrap();
        assert_eq!(stats.request, Request::Stats);
        assert_eq!(stats.id, None);

        let feedback: Envelope =
            serde_json::from_str(r#"{"op":"feedback","decision_id":"x","score":0.5}"#).unwrap();
        assert_eq!(
            feedback.request,
            Request::Feedback {
                decision_id: "x".to_string(),
                score: 0.5
            }
        );
    }

    #[test]
    fn test_unknown_op_is_rejected() {
        assert!(serde_json::from_str::<Envelope>(r#"{"op":"shutdown"}"#).is_err());
    }

    #[tokio::test]
    async fn test_malformed_line_gets_error_reply() {
        let router = Router::empty(RouterConfig::default()).unwrap();
        let reply = handle_line(&router, None, "not json", &CancellationToken::new()).await;
        assert_eq!(reply["ok"], json!(false));
        assert!(reply["error"].as_str().unwrap().starts_with("invalid request"));
    }

    #[tokio::test]
    async fn test_errors_are_replies() {
        let router = Router::empty(RouterConfig::default()).unwrap();
        let cancel = CancellationToken::new();

        let reply = handle_line(
            &router,
            None,
            r#"{"id":"r1","op":"route","text":"hello"}"#,
            &cancel,
        )
        .await;
        assert_eq!(reply["ok"], json!(false));
        assert_eq!(reply["id"], json!("r1"));
        assert!(reply["error"].as_str().unwrap().contains("no available model"));

        let reply = handle_line(
            &router,
            None,
            r#"{"op":"explain","decision_id":"not-a-uuid"}"#,
            &cancel,
        )
        .await;
        assert!(reply["error"].as_str().unwrap().contains("invalid decision id"));
    }

    #[tokio::test]
    async fn test_feedback_for_unknown_decision_is_ok() {
        let router = Router::empty(RouterConfig::default()).unwrap();
        let line = format!(
            r#"{{"op":"feedback","decision_id":"{}","score":1.0}}"#,
            DecisionId::new()
        );
        let reply = handle_line(&router, None, &line, &CancellationToken::new()).await;
        assert_eq!(reply["ok"], json!(true));
        assert_eq!(reply["applied"], json!(false));
    }

    #[tokio::test]
    async fn test_serve_answers_every_line() {
        let router = Arc::new(Router::empty(RouterConfig::default()).unwrap());
        let input = b"{\"op\":\"stats\",\"id\":1}\n\n{\"op\":\"suggestions\",\"id\":2}\nbroken\n";
        let (client, server_side) = tokio::io::duplex(64 * 1024);

        serve(
            router,
            None,
            tokio::io::BufReader::new(&input[..]),
            server_side,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let mut output = String::new();
        let mut reader = tokio::io::BufReader::new(client);
        let mut replies = Vec::new();
        while reader.read_line(&mut output).await.unwrap() > 0 {
            replies.push(serde_json::from_str::<Value>(output.trim()).unwrap());
            output.clear();
        }
        assert_eq!(replies.len(), 3);
        assert!(replies.iter().any(|r| r["id"] == json!(1) && r["ok"] == json!(true)));
        assert!(replies.iter().any(|r| r["id"] == json!(2) && r["ok"] == json!(true)));
        assert!(replies.iter().any(|r| r["ok"] == json!(false)));
    }

    #[tokio::test]
    async fn test_shutdown_drains_accepted_requests() {
        let router = Router::empty(RouterConfig::default()).unwrap();
        router
            .register_model(ModelDescriptor::new(
                "slow",
                Arc::new(Slow(Duration::from_millis(200))),
            ))
            .unwrap();
        let router = Arc::new(router);

        let (mut input, server_input) = tokio::io::duplex(4 * 1024);
        let (output, server_output) = tokio::io::duplex(64 * 1024);
        input
            .write_all(b"{\"op\":\"route\",\"text\":\"summarize this log\",\"id\":1}\n")
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(
            Arc::clone(&router),
            None,
            tokio::io::BufReader::new(server_input),
            server_output,
            shutdown.clone(),
        ));
        // let the line be accepted, then stop while the backend is still busy
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        server.await.unwrap().unwrap();

        let mut reader = tokio::io::BufReader::new(output);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let reply: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(reply["id"], json!(1));
        assert_eq!(reply["ok"], json!(true), "{reply}");
        assert_eq!(reply["model_id"], json!("slow"));
        assert_eq!(router.metrics().cancellations, 0);
        drop(input);
    }
}
