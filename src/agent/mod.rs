//! HardenedAgent：在 Supervisor 监管下驱动 LlmClient + ToolExecutor 的控制循环
//!
//! 每步：调用模型 → 累计 token → evaluate_turn → 按裁决行动：
//! - Halt：熔断器跳闸，结束（Halted）
//! - 终止型覆盖（force_synthesis / immediate_synthesis）：用已有信息综合答案（Synthesizing）
//! - 其他覆盖：有对应工具时强制调用该工具，否则作为纯协议动作直接产生观察结果（不经执行器）
//! - Proceed 且无工具调用：模型给出最终答案（Done）
//! - Proceed 且有工具调用：执行工具
//!
//! 相邻回复的结论翻转由 ContradictionDetector 发现，作为矛盾信号交给监管层（NOVELTY）。
//! 每个执行过的行动都写入账本；步数用完则 MaxSteps。单轮可恢复错误只产生 TurnError 事件，循环继续。

pub mod events;

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AgentSection;
use crate::core::{AgentError, CriticalState, Supervisor, Verdict};
use crate::llm::LlmClient;
use crate::monitoring::{
    CircuitBreakerStatus, ConfidenceEstimator, ContradictionDetector, SilverGauge, TurnSignals,
};
use crate::protocols::{OverrideAction, ProtocolResponse};
use crate::tools::{AuditContext, ToolExecutor};

pub use events::GuardEvent;

const PREVIEW_CHARS: usize = 200;
/// 重复签名的信息增益
const REPEAT_INFO_GAIN: f64 = 0.2;

/// 运行结束状态（全部为终态）
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    /// 熔断器跳闸
    Halted { reason: String },
    /// DEADLOCK / SCARCITY 的终止型覆盖
    Synthesizing { trigger: OverrideAction },
    /// 模型在无活跃类别时给出最终答案
    Done,
    MaxSteps,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Halted { .. } => "halted",
            RunOutcome::Synthesizing { .. } => "synthesizing",
            RunOutcome::Done => "done",
            RunOutcome::MaxSteps => "max_steps",
        }
    }
}

/// 一次运行的报告
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub session_id: String,
    pub outcome: RunOutcome,
    pub answer: Option<String>,
    /// 结束时所在的步
    pub steps: u32,
    pub tokens_used: u64,
    /// 依次发生的覆盖动作
    pub overrides: Vec<OverrideAction>,
    pub breaker: Option<CircuitBreakerStatus>,
}

struct Finish {
    outcome: RunOutcome,
    answer: Option<String>,
    steps: u32,
}

#[derive(Default)]
struct RunState {
    context: String,
    tokens_used: u64,
    overrides: Vec<OverrideAction>,
    last_observation: Option<String>,
    contradictions: ContradictionDetector,
}

/// 本步实际执行的行动
enum Action {
    /// 调用已注册工具；forced_by 为 None 表示模型自己的选择
    Tool {
        name: String,
        args: Value,
        forced_by: Option<OverrideAction>,
    },
    /// 没有对应工具的协议动作，观察结果由控制循环直接给出
    Protocol {
        action: OverrideAction,
        args: Value,
        observation: String,
    },
}

fn preview(s: &str) -> String {
    if s.chars().count() > PREVIEW_CHARS {
        format!("{}...", s.chars().take(PREVIEW_CHARS).collect::<String>())
    } else {
        s.to_string()
    }
}

pub struct HardenedAgent {
    llm: Arc<dyn LlmClient>,
    executor: ToolExecutor,
    supervisor: Arc<Supervisor>,
    max_steps: u32,
    token_budget: u64,
    event_tx: Option<mpsc::UnboundedSender<GuardEvent>>,
}

impl HardenedAgent {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        executor: ToolExecutor,
        supervisor: Arc<Supervisor>,
        config: &AgentSection,
    ) -> Self {
        Self {
            llm,
            executor,
            supervisor,
            max_steps: config.max_steps,
            token_budget: config.token_budget,
            event_tx: None,
        }
    }

    pub fn with_event_tx(mut self, tx: mpsc::UnboundedSender<GuardEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    fn send_event(&self, ev: GuardEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(ev);
        }
    }

    /// 以新会话运行一次；结束（含出错）后会话被移除，账本历史保留
    pub async fn run(&self, goal: &str, cancel: CancellationToken) -> Result<RunReport, AgentError> {
        let session_id = self.supervisor.new_session();
        tracing::info!(session_id = %session_id, goal, "hardened agent starting");

        let mut state = RunState {
            context: format!("Goal: {goal}\n"),
            ..Default::default()
        };
        let result = self.drive(&session_id, goal, &cancel, &mut state).await;
        let breaker = self.supervisor.end_session(&session_id);

        let metrics = self.supervisor.metrics();
        let finish = match result {
            Ok(finish) => finish,
            Err(e) => {
                metrics.record_completion(match e {
                    AgentError::Cancelled => "cancelled",
                    _ => "error",
                });
                return Err(e);
            }
        };
        metrics.record_completion(finish.outcome.as_str());
        tracing::info!(
            session_id = %session_id,
            outcome = ?finish.outcome,
            steps = finish.steps,
            tokens = state.tokens_used,
            "hardened agent finished"
        );
        Ok(RunReport {
            session_id,
            outcome: finish.outcome,
            answer: finish.answer,
            steps: finish.steps,
            tokens_used: state.tokens_used,
            overrides: state.overrides,
            breaker,
        })
    }

    async fn drive(
        &self,
        session_id: &str,
        goal: &str,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> Result<Finish, AgentError> {
        for step in 1..=self.max_steps {
            self.send_event(GuardEvent::StepUpdate {
                step,
                max_steps: self.max_steps,
            });

            if cancel.is_cancelled() {
                self.send_event(GuardEvent::Error {
                    text: "Cancelled by user".to_string(),
                });
                return Err(AgentError::Cancelled);
            }

            let started = Instant::now();
            let response = self
                .llm
                .complete(&self.build_prompt(&state.context))
                .await
                .map_err(AgentError::Llm)?;
            let metrics = self.supervisor.metrics();
            metrics.observe_llm_latency(started.elapsed().as_secs_f64());
            metrics.record_tokens(session_id, response.tokens_used);
            state.tokens_used += response.tokens_used;

            let mut signals = TurnSignals::new(response.content.clone())
                .step(step, self.max_steps)
                .tokens(state.tokens_used, self.token_budget);
            if let Some(contradiction) = state.contradictions.observe(&response.content) {
                tracing::debug!(session_id, step, description = %contradiction.description, "contradiction observed");
                signals = signals.contradiction(contradiction);
            }

            let outcome = match self.supervisor.evaluate_turn(session_id, &signals) {
                Ok(o) => o,
                Err(e) if e.is_turn_scoped() => {
                    tracing::warn!(session_id, step, error = %e, "turn skipped");
                    self.send_event(GuardEvent::TurnError {
                        step,
                        error: e.to_string(),
                    });
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            self.send_event(GuardEvent::Classified {
                step,
                state: outcome.detection.state,
                confidence: outcome.detection.confidence,
                reason: outcome.detection.reason.clone(),
            });

            let action = match outcome.verdict {
                Verdict::Halt => {
                    let reason = outcome
                        .breaker
                        .trip_reason()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "circuit breaker tripped".to_string());
                    self.send_event(GuardEvent::Halted {
                        step,
                        reason: reason.clone(),
                        recommendations: outcome.breaker.diagnostics.recommendations.clone(),
                    });
                    return Ok(Finish {
                        outcome: RunOutcome::Halted { reason },
                        answer: None,
                        steps: step,
                    });
                }
                Verdict::Override(protocol) => {
                    state.overrides.push(protocol.override_action);
                    self.send_event(GuardEvent::Override {
                        step,
                        action: protocol.override_action,
                        reasoning: protocol.reasoning.clone(),
                    });
                    if protocol.override_action.is_terminal() {
                        let answer = self.synthesize(outcome.detection.state, &protocol, state, &response.content);
                        self.send_event(GuardEvent::Answer {
                            text: answer.clone(),
                        });
                        return Ok(Finish {
                            outcome: RunOutcome::Synthesizing {
                                trigger: protocol.override_action,
                            },
                            answer: Some(answer),
                            steps: step,
                        });
                    }
                    self.protocol_action(session_id, goal, &protocol)
                }
                Verdict::Proceed => match response.tool_call {
                    None => {
                        self.send_event(GuardEvent::Answer {
                            text: response.content.clone(),
                        });
                        return Ok(Finish {
                            outcome: RunOutcome::Done,
                            answer: Some(response.content),
                            steps: step,
                        });
                    }
                    Some(call) => Action::Tool {
                        name: call.name,
                        args: call.args,
                        forced_by: None,
                    },
                },
            };

            let (tool, args_signature, observation) = match action {
                Action::Tool {
                    name,
                    args,
                    forced_by,
                } => {
                    let args_signature = args.to_string();
                    let gauge = SilverGauge::calculate(
                        ConfidenceEstimator::estimate(&response.content),
                        self.info_gain(session_id, &name, &args_signature),
                    );
                    tracing::debug!(session_id, step, tool = %name, k = gauge.k_explore, kind = ?gauge.kind, "action gauge");
                    self.send_event(GuardEvent::ToolCall {
                        step,
                        tool: name.clone(),
                        args: args.clone(),
                        gauge,
                    });
                    let ctx = AuditContext {
                        session_id,
                        step,
                        forced_by,
                    };
                    let observation = self.run_tool(&name, args, &ctx).await;
                    (name, args_signature, observation)
                }
                Action::Protocol {
                    action,
                    args,
                    observation,
                } => {
                    self.send_event(GuardEvent::ProtocolAction {
                        step,
                        action,
                        args: args.clone(),
                    });
                    (action.as_str().to_string(), args.to_string(), observation)
                }
            };

            self.send_event(GuardEvent::Observation {
                tool: tool.clone(),
                preview: preview(&observation),
            });

            if let Err(e) = self.supervisor.record_action(
                session_id,
                &tool,
                &args_signature,
                &preview(&observation),
                response.tokens_used,
            ) {
                if !e.is_turn_scoped() {
                    return Err(e.into());
                }
                tracing::warn!(session_id, step, error = %e, "action not recorded");
                self.send_event(GuardEvent::TurnError {
                    step,
                    error: e.to_string(),
                });
            }

            state.context.push_str(&format!(
                "\nThought: {}\nState: {}\nAction: {}({})\nObservation: {}\n",
                response.content,
                outcome.detection.state.as_str(),
                tool,
                args_signature,
                preview(&observation)
            ));
            state.last_observation = Some(observation);
        }

        Ok(Finish {
            outcome: RunOutcome::MaxSteps,
            answer: None,
            steps: self.max_steps,
        })
    }

    fn build_prompt(&self, context: &str) -> String {
        let tools = self
            .executor
            .registry()
            .tool_descriptions()
            .into_iter()
            .map(|(name, desc)| format!("- {name}: {desc}"))
            .collect::<Vec<_>>()
            .join("\n");
        format!("Available tools:\n{tools}\n\n{context}")
    }

    /// 工具失败不终止循环：错误文本作为观察结果
    async fn run_tool(&self, tool: &str, args: Value, ctx: &AuditContext<'_>) -> String {
        match self.executor.execute(tool, args, ctx).await {
            Ok(out) => out,
            Err(e) => {
                self.send_event(GuardEvent::ToolFailure {
                    tool: tool.to_string(),
                    reason: e.to_string(),
                });
                format!("Error: {e}")
            }
        }
    }

    /// 最近窗口内出现过同一签名时信息增益很低
    fn info_gain(&self, session_id: &str, tool: &str, args: &str) -> f64 {
        let window = self.supervisor.monitor().detector().window();
        match self.supervisor.ledger().recent_signatures(session_id, window) {
            Ok(recent) if recent.iter().any(|s| s.tool == tool && s.args == args) => REPEAT_INFO_GAIN,
            _ => 1.0,
        }
    }

    fn last_tool(&self, session_id: &str) -> Option<String> {
        self.supervisor
            .ledger()
            .recent(session_id, 1)
            .ok()
            .and_then(|records| records.into_iter().next())
            .map(|r| r.tool)
    }

    /// 非终止型覆盖对应的实际行动；没有可用工具时退化为纯协议动作
    fn protocol_action(&self, session_id: &str, goal: &str, protocol: &ProtocolResponse) -> Action {
        let names = self.executor.tool_names();
        let has_search = names.iter().any(|n| n == "search");
        let forced_by = Some(protocol.override_action);
        let meta = |key: &str| protocol.metadata.get(key).cloned().unwrap_or(Value::Null);
        let protocol_only = |observation: String| Action::Protocol {
            action: protocol.override_action,
            args: Value::Object(protocol.metadata.clone()),
            observation,
        };

        match protocol.override_action {
            OverrideAction::ForceDifferentTool => {
                let last = self.last_tool(session_id);
                match names.into_iter().find(|name| Some(name) != last.as_ref()) {
                    Some(name) => Action::Tool {
                        name,
                        args: json!({ "query": goal, "text": goal }),
                        forced_by,
                    },
                    None => protocol_only(format!(
                        "No tool other than '{}' is available. Dropping the repeated action.",
                        last.unwrap_or_default()
                    )),
                }
            }
            OverrideAction::TankMode if has_search => Action::Tool {
                name: "search".to_string(),
                args: json!({ "query": goal, "sources": meta("allowed_sources") }),
                forced_by,
            },
            OverrideAction::TankMode => protocol_only(format!(
                "Switching to conservative sources: {}",
                meta("allowed_sources")
            )),
            OverrideAction::ForceDeeperResearch if has_search => Action::Tool {
                name: "search".to_string(),
                args: json!({ "query": format!("{goal} contrary evidence") }),
                forced_by,
            },
            OverrideAction::ForceDeeperResearch => protocol_only(format!(
                "Deeper research required: at least {} more sources, including contrary evidence.",
                meta("require_additional_sources")
            )),
            OverrideAction::IntegrateContradiction => protocol_only(format!(
                "Contradiction flagged: {}. Sources re-ranked and confidence re-estimated.",
                meta("contradiction").as_str().unwrap_or("conflicting conclusions")
            )),
            OverrideAction::ForceSynthesis | OverrideAction::ImmediateSynthesis => {
                protocol_only(format!("Executed protocol action: {}", protocol.override_action))
            }
        }
    }

    fn synthesize(
        &self,
        trigger: CriticalState,
        protocol: &ProtocolResponse,
        state: &RunState,
        latest: &str,
    ) -> String {
        let basis = state.last_observation.as_deref().unwrap_or(latest);
        let mut answer = format!("Synthesized answer (forced by {trigger}): {}", preview(basis));
        if let Some(caveat) = protocol.metadata.get("caveat_text").and_then(Value::as_str) {
            answer.push_str("\n\n");
            answer.push_str(caveat);
        }
        answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::llm::{LlmResponse, MockBehavior, MockLlmClient, ToolCall};
    use crate::memory::InMemoryLedger;
    use crate::tools::{default_registry, EchoTool, SearchTool, ToolRegistry};

    fn agent(llm: MockLlmClient) -> HardenedAgent {
        agent_with_tools(llm, default_registry())
    }

    fn agent_with_tools(llm: MockLlmClient, registry: ToolRegistry) -> HardenedAgent {
        let config = AppConfig::default();
        let supervisor =
            Arc::new(Supervisor::new(&config, Arc::new(InMemoryLedger::new())).unwrap());
        HardenedAgent::new(
            Arc::new(llm),
            ToolExecutor::new(registry, 5),
            supervisor,
            &config.agent,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<GuardEvent>) -> Vec<GuardEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn test_normal_run_finishes() {
        let report = agent(MockLlmClient::new(MockBehavior::Normal))
            .run("What is Rust?", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Done);
        assert_eq!(report.steps, 2);
        assert!(report.overrides.is_empty());
        assert_eq!(report.tokens_used, 200);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_step() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let a = agent(MockLlmClient::new(MockBehavior::Normal));
        let err = a.run("x", cancel).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert!(a.supervisor().active_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_tool_is_an_observation_not_a_crash() {
        let llm = MockLlmClient::scripted([
            LlmResponse::with_tool("Let me use this.", ToolCall::new("teleport", json!({})), 10),
            LlmResponse::answer("Done here.", 10),
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let report = agent(llm)
            .with_event_tx(tx)
            .run("x", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Done);

        let mut saw_failure = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, GuardEvent::ToolFailure { .. }) {
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_force_different_tool_picks_another_tool() {
        let a = agent(MockLlmClient::new(MockBehavior::LoopForever));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let a = a.with_event_tx(tx);
        a.run("find it", CancellationToken::new()).await.unwrap();

        let mut after_override = None;
        let mut pending = false;
        while let Ok(ev) = rx.try_recv() {
            match ev {
                GuardEvent::Override { action: OverrideAction::ForceDifferentTool, .. } => pending = true,
                GuardEvent::ToolCall { tool, .. } if pending && after_override.is_none() => {
                    after_override = Some(tool);
                }
                _ => {}
            }
        }
        assert_eq!(after_override.as_deref(), Some("echo"));
    }

    #[tokio::test]
    async fn test_tank_mode_without_search_is_not_a_tool_failure() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let a = agent_with_tools(MockLlmClient::new(MockBehavior::Confused), registry)
            .with_event_tx(tx);
        let report = a.run("Explain it", CancellationToken::new()).await.unwrap();
        assert_eq!(report.overrides, vec![OverrideAction::TankMode; 2]);

        let events = drain(&mut rx);
        assert!(!events.iter().any(|e| matches!(e, GuardEvent::ToolFailure { .. })));
        let protocol_actions = events
            .iter()
            .filter(|e| matches!(e, GuardEvent::ProtocolAction { action: OverrideAction::TankMode, .. }))
            .count();
        assert_eq!(protocol_actions, 2);

        let recorded = a.supervisor().ledger().recent(&report.session_id, 10).unwrap();
        assert_eq!(recorded.len(), 2);
        assert!(recorded.iter().all(|r| r.tool == "tank_mode"));
        assert!(recorded[0].result_summary.starts_with("Switching to conservative sources"));
        assert!(recorded[0].args_signature.contains("wikipedia"));
    }

    #[tokio::test]
    async fn test_force_different_tool_without_alternative() {
        let mut registry = ToolRegistry::new();
        registry.register(SearchTool::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let a = agent_with_tools(MockLlmClient::new(MockBehavior::LoopForever), registry)
            .with_event_tx(tx);
        a.run("find it", CancellationToken::new()).await.unwrap();

        let events = drain(&mut rx);
        assert!(!events.iter().any(|e| matches!(e, GuardEvent::ToolFailure { .. })));
        let observation = events.iter().find_map(|e| match e {
            GuardEvent::Observation { tool, preview } if tool == "force_different_tool" => {
                Some(preview.clone())
            }
            _ => None,
        });
        assert!(observation.unwrap().contains("No tool other than 'search'"));
    }
}
