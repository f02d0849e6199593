//! Research orchestration.
//!
//! The single public entry point. Per invocation: response-cache lookup →
//! knowledge retrieval → strategy selection (LLM phase selector with a rule
//! fallback, then intent overrides) → standard single pass or deep
//! multi-pass with satisfaction evaluation → post-processing into a uniform
//! findings array → persistence (research index + response cache).
//!
//! Dependency direction is strictly one-way: the orchestrator calls the
//! knowledge retriever, the retriever reads the index, and the index is
//! written only here, on pass completion.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::error::{BlockKind, ResearchError};
use crate::core::events::{emit, EventSink};
use crate::core::types::{
    Finding, Intelligence, PhasePlan, ResearchMode, ResearchRequest, ResearchResult,
    ResearchStats, SourceReport,
};
use crate::llm::{extract_json_object, LlmInvoker, LlmRole};
use crate::memory::knowledge::{topic_from_query, KnowledgeRetriever};
use crate::memory::{ResearchIndex, ResearchIndexEntry, ResponseCache};
use crate::registry::VendorRegistry;
use crate::research::intelligence::{IntelligenceGatherer, Phase1Result};
use crate::research::requirements::{RequirementsReasoner, RequirementsReasoning};
use crate::research::vendor_search::{Phase2Result, VendorSearch};

/// Selected strategy for one invocation.
#[derive(Debug, Clone)]
pub struct StrategyPlan {
    pub plan: PhasePlan,
    pub max_sources_phase1: usize,
    pub max_sources_phase2: usize,
    pub reason: String,
    pub llm_confidence: f64,
    /// Refined search queries from deep-mode goal generation.
    pub refined_queries: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SatisfactionEvaluation {
    /// "CONTINUE" | "COMPLETE"
    pub decision: String,
    pub coverage_met: bool,
    pub quality_met: bool,
    pub completeness_met: bool,
    pub contradictions_met: bool,
    pub missing: Vec<String>,
}

impl SatisfactionEvaluation {
    pub fn all_met(&self) -> bool {
        self.coverage_met && self.quality_met && self.completeness_met && self.contradictions_met
    }

    pub fn is_complete(&self) -> bool {
        self.decision == "COMPLETE"
    }
}

pub struct ResearchOrchestrator {
    llm: Arc<dyn LlmInvoker>,
    gatherer: Arc<IntelligenceGatherer>,
    vendor_search: Arc<VendorSearch>,
    reasoner: Arc<RequirementsReasoner>,
    knowledge: Arc<KnowledgeRetriever>,
    index: Arc<ResearchIndex>,
    response_cache: Arc<ResponseCache>,
    vendors: Arc<VendorRegistry>,
    events: Option<Arc<dyn EventSink>>,
    max_passes: usize,
}

impl ResearchOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn LlmInvoker>,
        gatherer: Arc<IntelligenceGatherer>,
        vendor_search: Arc<VendorSearch>,
        reasoner: Arc<RequirementsReasoner>,
        knowledge: Arc<KnowledgeRetriever>,
        index: Arc<ResearchIndex>,
        response_cache: Arc<ResponseCache>,
        vendors: Arc<VendorRegistry>,
        events: Option<Arc<dyn EventSink>>,
        max_passes: usize,
    ) -> Self {
        Self {
            llm,
            gatherer,
            vendor_search,
            reasoner,
            knowledge,
            index,
            response_cache,
            vendors,
            events,
            max_passes: max_passes.max(1),
        }
    }

    /// Run one research invocation end to end.
    pub async fn research(
        &self,
        request: &ResearchRequest,
        cancel: &CancellationToken,
    ) -> Result<ResearchResult, ResearchError> {
        let started = Instant::now();
        let goal = request.effective_goal().to_string();
        emit(
            &self.events,
            "research_started",
            serde_json::json!({"query": request.query.as_str(), "intent": request.intent.as_str(), "mode": request.mode}),
        );

        // 1. Response cache.
        if !request.force_refresh {
            if let Some(cached) = self.try_cached(request).await {
                info!("[Research] serving cached response for '{}'", request.query);
                return Ok(cached);
            }
        }

        // 2. Knowledge retrieval (read-only path into the index).
        let (topic, keywords) = topic_from_query(&request.query);
        let knowledge = self.knowledge.retrieve(
            &topic,
            &keywords,
            request.intent,
            &request.session_id,
        );

        // 3. Strategy selection.
        let mut strategy = self
            .select_strategy(request, knowledge.phase1_skip_recommended)
            .await;
        if request.budget > 0 {
            strategy.max_sources_phase1 = strategy.max_sources_phase1.min(request.budget);
            strategy.max_sources_phase2 = strategy.max_sources_phase2.min(request.budget);
        }
        info!(
            "[Research] strategy: {} (p1={} p2={}) — {}",
            strategy.plan.as_str(),
            strategy.max_sources_phase1,
            strategy.max_sources_phase2,
            strategy.reason
        );

        // 4. Execute passes.
        let effective_passes = match request.mode {
            ResearchMode::Standard => 1,
            ResearchMode::Deep => self.max_passes,
        };

        let mut intelligence: Option<Intelligence> = None;
        let mut sources: Vec<SourceReport> = Vec::new();
        let mut reasoning: Option<RequirementsReasoning> = None;
        let mut phase2: Phase2Result = Phase2Result::default();
        let mut stats = ResearchStats::default();
        let mut intelligence_cached = false;
        let mut passes_executed = 0usize;

        for pass in 1..=effective_passes {
            if cancel.is_cancelled() {
                stats.cancelled = true;
                break;
            }
            passes_executed = pass;
            info!("[Research] === pass {}/{} ===", pass, effective_passes);

            // Phase 1 only on the first pass; intelligence carries forward.
            if pass == 1 && strategy.plan.runs_phase1() {
                let phase1: Phase1Result = self
                    .gatherer
                    .gather(
                        &request.query,
                        &goal,
                        strategy.max_sources_phase1.max(1),
                        &request.session_id,
                        if strategy.refined_queries.is_empty() {
                            None
                        } else {
                            Some(strategy.refined_queries.clone())
                        },
                        cancel,
                    )
                    .await;

                if phase1.all_blocked && !strategy.plan.runs_phase2() {
                    return Err(ResearchError::blocked("all engines", BlockKind::BotDetection));
                }
                stats.sources_visited += phase1.sources_visited;
                sources.extend(phase1.sources);
                intelligence = Some(phase1.intelligence);
                intelligence_cached = true;
            }

            if cancel.is_cancelled() {
                stats.cancelled = true;
                break;
            }

            // Phase 2.
            if strategy.plan.runs_phase2() {
                let intel = intelligence.clone().unwrap_or_default();
                if reasoning.is_none() {
                    reasoning = Some(self.derive_requirements(request, &intel).await);
                }
                let Some(reasoning_ref) = reasoning.as_ref() else {
                    continue;
                };

                let result = self
                    .vendor_search
                    .search_products(
                        &goal,
                        &intel,
                        reasoning_ref,
                        &request.session_id,
                        strategy.max_sources_phase2.clamp(1, 20),
                        cancel,
                    )
                    .await;

                stats.vendors_visited += result.vendors_visited;
                stats.vendors_blocked += result.vendors_blocked;
                stats.findings_rejected += result.rejected.len();
                // Later passes extend; first emission order per vendor holds.
                phase2.failure_reasons.extend(result.failure_reasons);
                phase2.rejected.extend(result.rejected);
                phase2.findings.extend(result.findings);
                phase2.vendors_visited += result.vendors_visited;
                phase2.vendors_blocked += result.vendors_blocked;
            }

            // Deep mode: evaluate satisfaction and refine or stop.
            if request.mode == ResearchMode::Deep {
                let evaluation = self
                    .evaluate_satisfaction(request, pass, &phase2.findings, &sources)
                    .await;
                info!(
                    "[Research] pass {} evaluation: {} (coverage={}, quality={}, completeness={}, contradictions={})",
                    pass,
                    evaluation.decision,
                    evaluation.coverage_met,
                    evaluation.quality_met,
                    evaluation.completeness_met,
                    evaluation.contradictions_met
                );
                emit(
                    &self.events,
                    "pass_evaluated",
                    serde_json::json!({"pass": pass, "decision": evaluation.decision.as_str()}),
                );

                if evaluation.is_complete() {
                    break;
                }
                if pass >= effective_passes {
                    warn!(
                        "[Research] reached safety cap ({} passes) — stopping despite incomplete criteria",
                        effective_passes
                    );
                    break;
                }
                strategy = self.refine_strategy(request, strategy, &evaluation).await;
            }
        }

        // 5. Post-process: uniform findings array.
        let findings = if strategy.plan.runs_phase2() {
            std::mem::take(&mut phase2.findings)
        } else {
            findings_from_sources(&sources)
        };

        let mut failure_reasons = std::mem::take(&mut phase2.failure_reasons);
        if findings.is_empty() {
            for vendor in self.vendors.get_blocked_vendors() {
                failure_reasons.push(format!(
                    "{} quarantined ({})",
                    vendor.domain, vendor.block_type
                ));
            }
        }

        stats.passes_executed = passes_executed;
        stats.duration_ms = started.elapsed().as_millis() as u64;

        let result = ResearchResult {
            query: request.query.clone(),
            intent: request.intent,
            mode: request.mode,
            strategy_used: strategy.plan,
            passes: passes_executed,
            findings,
            rejected_findings: std::mem::take(&mut phase2.rejected),
            intelligence,
            sources,
            stats,
            intelligence_cached,
            failure_reasons,
        };

        // 6. Persist (skip when cancelled mid-run: only completed work may
        // touch durable stores).
        if !result.stats.cancelled {
            self.persist(request, &result).await;
        }

        emit(
            &self.events,
            "research_complete",
            serde_json::json!({
                "findings": result.findings.len(),
                "passes": result.passes,
                "cancelled": result.stats.cancelled,
            }),
        );
        Ok(result)
    }

    async fn try_cached(&self, request: &ResearchRequest) -> Option<ResearchResult> {
        let candidates = self
            .response_cache
            .search(&request.query, request.intent, &request.session_id)
            .await;
        let best = candidates.into_iter().next()?;
        let mut result: ResearchResult = serde_json::from_str(&best.entry.response).ok()?;
        result.stats.cache_hit = true;
        Some(result)
    }

    /// Strategy selection: LLM phase selector, rule fallback, then the
    /// intent override — non-commerce intents are clamped to phase1_only and
    /// commerce always gets a phase 2, whatever the model said.
    async fn select_strategy(
        &self,
        request: &ResearchRequest,
        phase1_skippable: bool,
    ) -> StrategyPlan {
        let mut strategy = match self.llm_select_strategy(request, phase1_skippable).await {
            Some(s) => s,
            None => self.fallback_strategy(request, phase1_skippable),
        };

        // Intent overrides take precedence over both selectors.
        if !request.intent.is_commerce() && strategy.plan != PhasePlan::Phase1Only {
            strategy.plan = PhasePlan::Phase1Only;
            strategy.max_sources_phase2 = 0;
            strategy.reason = format!(
                "{} (clamped to phase1_only for {} intent)",
                strategy.reason,
                request.intent.as_str()
            );
        }
        if request.intent.is_commerce() && !strategy.plan.runs_phase2() {
            strategy.plan = if phase1_skippable {
                PhasePlan::Phase2Only
            } else {
                PhasePlan::Phase1AndPhase2
            };
            if strategy.max_sources_phase2 == 0 {
                strategy.max_sources_phase2 = 10;
            }
            strategy.reason = format!("{} (commerce intent forces phase 2)", strategy.reason);
        }
        strategy
    }

    async fn llm_select_strategy(
        &self,
        request: &ResearchRequest,
        phase1_skippable: bool,
    ) -> Option<StrategyPlan> {
        let prompt = format!(
            "Query: \"{}\"\nIntent: {}\nMode: {:?}\nCached intelligence available: {}\n\n\
             Phase 1 gathers intelligence from the open web; Phase 2 visits \
             vendors and extracts products. Select the phases. Respond with JSON:\n\
             {{\"phases\": \"phase1_only|phase2_only|phase1_and_phase2\", \
             \"max_sources_phase1\": int, \"max_sources_phase2\": int, \
             \"reason\": \"…\", \"confidence\": 0.0-1.0}}",
            request.query,
            request.intent.as_str(),
            request.mode,
            phase1_skippable,
        );

        let response = match self.llm.call(&prompt, LlmRole::PhaseSelector, 250, 0.0).await {
            Ok(r) => r,
            Err(e) => {
                warn!("[Research] LLM phase selection failed: {} — using fallback", e);
                return None;
            }
        };
        let value = extract_json_object(&response)?;
        let plan = match value.get("phases").and_then(|v| v.as_str())? {
            "phase1_only" => PhasePlan::Phase1Only,
            "phase2_only" => PhasePlan::Phase2Only,
            _ => PhasePlan::Phase1AndPhase2,
        };
        Some(StrategyPlan {
            plan,
            max_sources_phase1: value
                .get("max_sources_phase1")
                .and_then(|v| v.as_u64())
                .unwrap_or(10) as usize,
            max_sources_phase2: value
                .get("max_sources_phase2")
                .and_then(|v| v.as_u64())
                .unwrap_or(10) as usize,
            reason: value
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or("LLM phase selection")
                .to_string(),
            llm_confidence: value.get("confidence").and_then(|v| v.as_f64()).unwrap_or(0.0),
            refined_queries: Vec::new(),
        })
    }

    /// Rule-based fallback: non-commerce → phase1_only; commerce with cached
    /// intel → phase2_only; commerce without → both.
    fn fallback_strategy(&self, request: &ResearchRequest, phase1_skippable: bool) -> StrategyPlan {
        if !request.intent.is_commerce() {
            StrategyPlan {
                plan: PhasePlan::Phase1Only,
                max_sources_phase1: 10,
                max_sources_phase2: 0,
                reason: format!(
                    "Non-commerce intent '{}' - Phase 1 only (fallback rule)",
                    request.intent.as_str()
                ),
                llm_confidence: 0.0,
                refined_queries: Vec::new(),
            }
        } else if phase1_skippable {
            StrategyPlan {
                plan: PhasePlan::Phase2Only,
                max_sources_phase1: 0,
                max_sources_phase2: 10,
                reason: "Cached intelligence available (fallback rule)".to_string(),
                llm_confidence: 0.0,
                refined_queries: Vec::new(),
            }
        } else {
            StrategyPlan {
                plan: PhasePlan::Phase1AndPhase2,
                max_sources_phase1: 10,
                max_sources_phase2: 12,
                reason: "No cached intelligence (fallback rule)".to_string(),
                llm_confidence: 0.0,
                refined_queries: Vec::new(),
            }
        }
    }

    async fn derive_requirements(
        &self,
        request: &ResearchRequest,
        intelligence: &Intelligence,
    ) -> RequirementsReasoning {
        match self
            .reasoner
            .derive(&request.query, intelligence, &request.constraints)
            .await
        {
            Ok(reasoning) => reasoning,
            Err(e) => {
                warn!("[Research] requirements reasoning failed: {} — minimal fallback", e);
                let mut reasoning = RequirementsReasoning::default();
                reasoning.requirements.query = request.query.clone();
                reasoning.requirements.category = request
                    .query
                    .split_whitespace()
                    .find(|w| w.len() > 3)
                    .unwrap_or("")
                    .to_lowercase();
                reasoning.optimized_query = request.query.clone();
                // Budget constraints still apply even without the LLM.
                if let Some(budget) = request.constraints.get("budget") {
                    reasoning.requirements.budget.max =
                        crate::research::vendor_search::parse_price(budget);
                }
                reasoning
            }
        }
    }

    async fn evaluate_satisfaction(
        &self,
        request: &ResearchRequest,
        pass: usize,
        findings: &[Finding],
        sources: &[SourceReport],
    ) -> SatisfactionEvaluation {
        let prompt = format!(
            "Query: \"{}\" (intent: {})\nPass {} results: {} findings, {} sources.\n\
             Findings sample:\n{}\n\n\
             Judge whether research satisfies the goal on four criteria. \
             Respond with JSON:\n\
             {{\"decision\": \"CONTINUE|COMPLETE\", \"criteria\": {{\
             \"coverage\": {{\"met\": bool}}, \"quality\": {{\"met\": bool}}, \
             \"completeness\": {{\"met\": bool}}, \"contradictions\": {{\"met\": bool}}}}, \
             \"missing\": [\"…\"]}}",
            request.query,
            request.intent.as_str(),
            pass,
            findings.len(),
            sources.len(),
            findings
                .iter()
                .take(5)
                .map(|f| format!("  - {} (${:?}) from {}", f.name, f.price, f.vendor))
                .collect::<Vec<_>>()
                .join("\n"),
        );

        match self
            .llm
            .call(&prompt, LlmRole::SatisfactionEvaluator, 300, 0.0)
            .await
        {
            Ok(response) => match extract_json_object(&response) {
                Some(value) => {
                    let met = |criterion: &str| {
                        value
                            .pointer(&format!("/criteria/{}/met", criterion))
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false)
                    };
                    SatisfactionEvaluation {
                        decision: value
                            .get("decision")
                            .and_then(|v| v.as_str())
                            .unwrap_or("CONTINUE")
                            .to_uppercase(),
                        coverage_met: met("coverage"),
                        quality_met: met("quality"),
                        completeness_met: met("completeness"),
                        contradictions_met: met("contradictions"),
                        missing: value
                            .get("missing")
                            .and_then(|v| v.as_array())
                            .map(|arr| {
                                arr.iter()
                                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                                    .collect()
                            })
                            .unwrap_or_default(),
                    }
                }
                None => self.fallback_satisfaction(findings, sources),
            },
            Err(e) => {
                warn!("[Research] satisfaction evaluation failed: {} — rule fallback", e);
                self.fallback_satisfaction(findings, sources)
            }
        }
    }

    fn fallback_satisfaction(
        &self,
        findings: &[Finding],
        sources: &[SourceReport],
    ) -> SatisfactionEvaluation {
        let enough = findings.len() >= 3 || (findings.is_empty() && sources.len() >= 5);
        SatisfactionEvaluation {
            decision: if enough { "COMPLETE" } else { "CONTINUE" }.to_string(),
            coverage_met: enough,
            quality_met: enough,
            completeness_met: enough,
            contradictions_met: true,
            missing: Vec::new(),
        }
    }

    /// Deep-mode refinement: the LLM turns the evaluation gaps into a
    /// to-do list of refined queries and widens the source budget.
    async fn refine_strategy(
        &self,
        request: &ResearchRequest,
        mut strategy: StrategyPlan,
        evaluation: &SatisfactionEvaluation,
    ) -> StrategyPlan {
        if !evaluation.coverage_met {
            strategy.max_sources_phase2 = (strategy.max_sources_phase2 + 3).min(20);
        }

        let prompt = format!(
            "Query: \"{}\"\nUnmet criteria: coverage={}, quality={}, completeness={}.\n\
             Missing: {:?}\n\n\
             Generate 2-3 refined research queries targeting the gaps. \
             Respond with JSON: {{\"queries\": [\"…\"]}}",
            request.query,
            evaluation.coverage_met,
            evaluation.quality_met,
            evaluation.completeness_met,
            evaluation.missing,
        );
        if let Ok(response) = self.llm.call(&prompt, LlmRole::GoalGenerator, 200, 0.3).await {
            if let Some(value) = extract_json_object(&response) {
                let queries: Vec<String> = value
                    .get("queries")
                    .and_then(|v| v.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_str().map(|s| s.to_string()))
                            .take(3)
                            .collect()
                    })
                    .unwrap_or_default();
                if !queries.is_empty() {
                    info!("[Research] refined queries for next pass: {:?}", queries);
                    strategy.refined_queries = queries;
                }
            }
        }
        strategy
    }

    async fn persist(&self, request: &ResearchRequest, result: &ResearchResult) {
        // Quality: blend of findings volume and source reliability.
        let finding_component = (result.findings.len() as f64 / 5.0).min(1.0) * 0.6;
        let source_component = if result.sources.is_empty() {
            0.0
        } else {
            (result.sources.iter().map(|s| s.reliability).sum::<f64>()
                / result.sources.len() as f64)
                * 0.4
        };
        let quality = finding_component + source_component;

        let (topic, keywords) = topic_from_query(&request.query);
        let entry = ResearchIndexEntry {
            id: uuid::Uuid::new_v4().to_string(),
            turn: request.turn_number,
            session_id: request.session_id.clone(),
            primary_topic: topic.clone(),
            keywords,
            intent: request.intent,
            quality,
            confidence_initial: 0.8,
            confidence_decay_rate: 0.05,
            created_at: Utc::now(),
            expires_at: Some(Utc::now() + ChronoDuration::days(7)),
            doc_path: String::new(),
            content_types: vec![
                if result.intelligence.is_some() {
                    "intelligence"
                } else {
                    "findings"
                }
                .to_string(),
            ],
        };
        if let Err(e) = self.index.upsert(&entry) {
            warn!("[Research] index persist failed: {}", e);
        }

        if let Ok(serialized) = serde_json::to_string(result) {
            self.response_cache
                .set(
                    &request.query,
                    request.intent,
                    &topic,
                    &serialized,
                    quality,
                    None,
                    &request.session_id,
                )
                .await;
        }
    }
}

/// Phase-1-only runs still return a uniform findings array, synthesized
/// from the read sources.
pub fn findings_from_sources(sources: &[SourceReport]) -> Vec<Finding> {
    sources
        .iter()
        .map(|source| Finding {
            name: crate::llm::truncate(&source.summary, 120),
            price: None,
            vendor: crate::core::types::normalize_host(&source.url),
            url: source.url.clone(),
            description: source.summary.clone(),
            confidence: source.reliability,
            strengths: Vec::new(),
            weaknesses: Vec::new(),
        })
        .collect()
}
