//! Requirements reasoning.
//!
//! One LLM call converts (query, Phase-1 intelligence, user constraints)
//! into structured validity criteria, and the same criteria that shaped the
//! search later filter the results: validity ("must be"), disqualifiers,
//! budget bounds, required specs, acceptable alternatives, and the optimized
//! Phase-2 search query.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::types::{Intelligence, PriceRange};
use crate::llm::{extract_json_object, LlmInvoker, LlmRole};

/// Structured product requirements used for navigation and validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductRequirements {
    /// Core category the item must be ("hamster", "laptop").
    pub category: String,
    pub query: String,

    /// Spec name → required value.
    #[serde(default)]
    pub required_specs: HashMap<String, String>,
    /// Spec name → acceptable variants. A product matching ANY is valid.
    #[serde(default)]
    pub acceptable_alternatives: HashMap<String, Vec<String>>,
    /// Any of these in a title/spec disqualifies the product.
    #[serde(default)]
    pub deal_breakers: Vec<String>,
    #[serde(default)]
    pub budget: PriceRange,

    /// Broadening tiers applied when strict filtering empties the result
    /// set. Each tier adds variants to `acceptable_alternatives`.
    #[serde(default)]
    pub relaxation_tiers: Vec<RelaxationTier>,
    #[serde(default)]
    pub current_relaxation_tier: u32,

    /// Stop early once this many matches are found.
    #[serde(default = "default_target_quantity")]
    pub target_quantity: usize,
}

fn default_target_quantity() -> usize {
    5
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelaxationTier {
    pub tier: u32,
    #[serde(default)]
    pub description: String,
    /// spec → extra acceptable variants
    #[serde(default)]
    pub add_to_acceptable: HashMap<String, Vec<String>>,
}

impl ProductRequirements {
    /// Fast title check before committing to an expensive detail-page
    /// extraction. Returns (worth_checking, reason).
    pub fn quick_title_check(&self, title: &str) -> (bool, String) {
        if title.is_empty() {
            return (true, "Empty title, verify via detail page".to_string());
        }
        let title_lower = title.to_lowercase();

        for breaker in &self.deal_breakers {
            if title_lower.contains(&breaker.to_lowercase()) {
                return (false, format!("Deal breaker found: '{}'", breaker));
            }
        }

        for (spec_key, alternatives) in &self.acceptable_alternatives {
            for alt in alternatives {
                if title_lower.contains(&alt.to_lowercase()) {
                    return (true, format!("Found {}: '{}'", spec_key, alt));
                }
            }
        }

        for (spec_key, spec_value) in &self.required_specs {
            if title_lower.contains(&spec_value.to_lowercase()) {
                return (true, format!("Found required {}: '{}'", spec_key, spec_value));
            }
        }

        if !self.category.is_empty() && title_lower.contains(&self.category.to_lowercase()) {
            return (true, format!("Category match: '{}'", self.category));
        }

        (true, "No clear match/rejection, verify via detail page".to_string())
    }

    /// Validate extracted specs against requirements.
    pub fn validate_specs(&self, specs: &HashMap<String, String>) -> (bool, String) {
        if specs.is_empty() {
            return (false, "No specs provided".to_string());
        }

        let specs_text = specs
            .values()
            .map(|v| v.to_lowercase())
            .collect::<Vec<_>>()
            .join(" ");

        for breaker in &self.deal_breakers {
            if specs_text.contains(&breaker.to_lowercase()) {
                return (false, format!("Deal breaker in specs: '{}'", breaker));
            }
        }

        for (spec_key, required_value) in &self.required_specs {
            let required_lower = required_value.to_lowercase();
            let satisfied = match specs.get(spec_key) {
                Some(value) => {
                    let value_lower = value.to_lowercase();
                    value_lower.contains(&required_lower)
                        || self
                            .acceptable_alternatives
                            .get(spec_key)
                            .map(|alts| {
                                alts.iter().any(|a| value_lower.contains(&a.to_lowercase()))
                            })
                            .unwrap_or(false)
                }
                None => {
                    // Spec key absent; look for the value anywhere.
                    specs_text.contains(&required_lower)
                        || self
                            .acceptable_alternatives
                            .get(spec_key)
                            .map(|alts| {
                                alts.iter().any(|a| specs_text.contains(&a.to_lowercase()))
                            })
                            .unwrap_or(false)
                }
            };
            if !satisfied {
                return (
                    false,
                    format!("Required spec '{}={}' not found", spec_key, required_value),
                );
            }
        }

        (true, "All requirements satisfied".to_string())
    }

    pub fn can_relax(&self) -> bool {
        (self.current_relaxation_tier as usize) < self.relaxation_tiers.len()
    }

    /// Apply the next relaxation tier, broadening acceptable alternatives.
    pub fn relax(&mut self) -> Option<String> {
        let tier = self
            .relaxation_tiers
            .get(self.current_relaxation_tier as usize)?
            .clone();
        for (spec, variants) in &tier.add_to_acceptable {
            let entry = self.acceptable_alternatives.entry(spec.clone()).or_default();
            for v in variants {
                if !entry.contains(v) {
                    entry.push(v.clone());
                }
            }
        }
        self.current_relaxation_tier += 1;
        info!(
            "[Requirements] relaxed to tier {}: {}",
            self.current_relaxation_tier, tier.description
        );
        Some(tier.description)
    }

    /// Concise context block for inline LLM prompts.
    pub fn to_prompt_context(&self) -> String {
        let mut lines = vec![format!("Category: {}", self.category)];
        if let Some(max) = self.budget.max {
            lines.push(format!("Budget: max ${:.0}", max));
        }
        if !self.required_specs.is_empty() {
            let specs: Vec<String> = self
                .required_specs
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            lines.push(format!("Required: {}", specs.join(", ")));
        }
        if !self.acceptable_alternatives.is_empty() {
            let alts: Vec<String> = self
                .acceptable_alternatives
                .iter()
                .map(|(k, vs)| format!("{}: {}", k, vs.join("/")))
                .collect();
            lines.push(format!("Acceptable: {}", alts.join("; ")));
        }
        if !self.deal_breakers.is_empty() {
            lines.push(format!("Reject if: {}", self.deal_breakers.join(", ")));
        }
        lines.join("\n")
    }
}

/// Full output of the requirements reasoner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequirementsReasoning {
    /// The raw reasoning document (kept for downstream prompt context).
    pub reasoning_document: String,
    /// What a valid result must be.
    #[serde(default)]
    pub must_be: Vec<String>,
    /// Categories that look similar but are wrong.
    #[serde(default)]
    pub wrong_category: Vec<String>,
    /// Terms whose presence disqualifies a result.
    #[serde(default)]
    pub excluded_terms: Vec<String>,
    pub requirements: ProductRequirements,
    /// Search query optimized for Phase-2 vendor discovery.
    pub optimized_query: String,
}

pub struct RequirementsReasoner {
    llm: Arc<dyn LlmInvoker>,
}

impl RequirementsReasoner {
    pub fn new(llm: Arc<dyn LlmInvoker>) -> Self {
        Self { llm }
    }

    /// Derive requirements from query + intelligence + user constraints.
    /// Temperature 0 so identical inputs produce a structurally equivalent
    /// document.
    pub async fn derive(
        &self,
        query: &str,
        intelligence: &Intelligence,
        constraints: &HashMap<String, String>,
    ) -> Result<RequirementsReasoning> {
        let prompt = self.build_prompt(query, intelligence, constraints);
        let response = self
            .llm
            .call(&prompt, LlmRole::RequirementsReasoner, 1200, 0.0)
            .await?;
        let value = extract_json_object(&response)
            .ok_or_else(|| anyhow!("no JSON in requirements reasoning response"))?;
        Ok(Self::parse(query, &response, &value, intelligence))
    }

    fn build_prompt(
        &self,
        query: &str,
        intelligence: &Intelligence,
        constraints: &HashMap<String, String>,
    ) -> String {
        let mut intel_lines = Vec::new();
        for (attr, finding) in &intelligence.specs_discovered {
            intel_lines.push(format!(
                "- {}: {} (confidence {:.2})",
                attr, finding.value, finding.confidence
            ));
        }
        for req in &intelligence.hard_requirements {
            intel_lines.push(format!("- hard requirement: {}", req));
        }
        for db in &intelligence.deal_breakers {
            intel_lines.push(format!("- deal breaker: {}", db));
        }
        if let (Some(min), Some(max)) = (intelligence.price_range.min, intelligence.price_range.max)
        {
            intel_lines.push(format!("- typical price range: ${:.0}–${:.0}", min, max));
        }

        let constraint_lines: Vec<String> = constraints
            .iter()
            .map(|(k, v)| format!("- {}: {}", k, v))
            .collect();

        format!(
            "User query: \"{query}\"\n\n\
             Research intelligence:\n{}\n\n\
             User constraints:\n{}\n\n\
             Derive purchase requirements. Respond with JSON:\n\
             {{\"category\": \"core item category\",\n \
             \"must_be\": [\"what any valid result must be\"],\n \
             \"wrong_category\": [\"similar-but-wrong categories\"],\n \
             \"excluded_terms\": [\"terms that disqualify\"],\n \
             \"budget\": {{\"min\": number|null, \"max\": number|null}},\n \
             \"required_specs\": {{\"spec\": \"value\"}},\n \
             \"acceptable_alternatives\": {{\"spec\": [\"variant\", …]}},\n \
             \"deal_breakers\": [\"…\"],\n \
             \"relaxation_tiers\": [{{\"tier\": 1, \"description\": \"…\", \"add_to_acceptable\": {{}}}}],\n \
             \"optimized_query\": \"best Phase-2 search query\"}}",
            if intel_lines.is_empty() {
                "- (none)".to_string()
            } else {
                intel_lines.join("\n")
            },
            if constraint_lines.is_empty() {
                "- (none)".to_string()
            } else {
                constraint_lines.join("\n")
            },
        )
    }

    fn parse(
        query: &str,
        raw: &str,
        value: &serde_json::Value,
        intelligence: &Intelligence,
    ) -> RequirementsReasoning {
        let str_vec = |key: &str| -> Vec<String> {
            value
                .get(key)
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default()
        };

        let required_specs: HashMap<String, String> = value
            .get("required_specs")
            .and_then(|v| v.as_object())
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let acceptable_alternatives: HashMap<String, Vec<String>> = value
            .get("acceptable_alternatives")
            .and_then(|v| v.as_object())
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| {
                        v.as_array().map(|arr| {
                            (
                                k.clone(),
                                arr.iter()
                                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                                    .collect(),
                            )
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut deal_breakers = str_vec("deal_breakers");
        // Intelligence deal-breakers always apply, whatever the model kept.
        for db in &intelligence.deal_breakers {
            if !deal_breakers.contains(db) {
                deal_breakers.push(db.clone());
            }
        }

        let budget = PriceRange {
            min: value.pointer("/budget/min").and_then(|v| v.as_f64()),
            max: value.pointer("/budget/max").and_then(|v| v.as_f64()),
        };

        let relaxation_tiers: Vec<RelaxationTier> = value
            .get("relaxation_tiers")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let category = value
            .get("category")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let optimized_query = value
            .get("optimized_query")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(query)
            .to_string();

        if category.is_empty() {
            warn!("[Requirements] reasoner returned no category for '{}'", query);
        }

        RequirementsReasoning {
            reasoning_document: raw.to_string(),
            must_be: str_vec("must_be"),
            wrong_category: str_vec("wrong_category"),
            excluded_terms: str_vec("excluded_terms"),
            requirements: ProductRequirements {
                category,
                query: query.to_string(),
                required_specs,
                acceptable_alternatives,
                deal_breakers,
                budget,
                relaxation_tiers,
                current_relaxation_tier: 0,
                target_quantity: default_target_quantity(),
            },
            optimized_query,
        }
    }
}
