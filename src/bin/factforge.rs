//! factforge fixture runner
//!
//! Loads a JSON fixture (references, assumptions, a ruleset artifact and
//! calculation requests), publishes, validates and activates the ruleset,
//! runs every request and prints the facts as JSON.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use factforge::storage::memory::InMemoryRuleStore;
use factforge::{
    Assumption, CalcEngine, CalcError, CalcResult, CalculationRequest, EngineConfig, EngineStores, Reference,
    Rule, RulesetArtifact, RulesetId,
};

struct Args {
    fixture: PathBuf,
    explain: bool,
}

fn usage() {
    println!("factforge - run a calculation fixture");
    println!();
    println!("USAGE:");
    println!("    factforge --fixture <FILE> [--explain]");
    println!();
    println!("OPTIONS:");
    println!("    -f, --fixture <FILE>   Fixture JSON file");
    println!("    -e, --explain          Print the provenance chain of every fact");
    println!("    -h, --help             Print help information");
    println!();
    println!("Logs go to stderr; set RUST_LOG (e.g. RUST_LOG=factforge=debug).");
}

fn parse_args() -> Result<Option<Args>, String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut fixture = None;
    let mut explain = false;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--fixture" | "-f" => {
                let Some(path) = args.get(i + 1) else {
                    return Err("--fixture requires a value".to_string());
                };
                fixture = Some(PathBuf::from(path));
                i += 2;
            }
            "--explain" | "-e" => {
                explain = true;
                i += 1;
            }
            "--help" | "-h" => return Ok(None),
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    let fixture = fixture.ok_or_else(|| "--fixture is required".to_string())?;
    Ok(Some(Args { fixture, explain }))
}

#[derive(Deserialize)]
struct Fixture {
    #[serde(default)]
    config: EngineConfig,
    #[serde(default)]
    references: Vec<Reference>,
    #[serde(default)]
    assumptions: Vec<Assumption>,
    ruleset: FixtureRuleset,
    #[serde(default)]
    requests: Vec<CalculationRequest>,
}

#[derive(Deserialize)]
struct FixtureRuleset {
    id: RulesetId,
    #[serde(default)]
    description: Option<String>,
    rules: Vec<Rule>,
}

#[derive(Serialize)]
struct RequestOutput {
    index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<factforge::ErrorReport>,
}

fn run(args: &Args) -> CalcResult<serde_json::Value> {
    let text = std::fs::read_to_string(&args.fixture)
        .map_err(|e| CalcError::internal(format!("cannot read {}: {e}", args.fixture.display())))?;
    let fixture: Fixture = serde_json::from_str(&text).map_err(|e| {
        CalcError::from(factforge::ValidationError::InvalidConfig {
            reason: format!("malformed fixture: {e}"),
        })
    })?;

    let rules = Arc::new(InMemoryRuleStore::new());
    for reference in fixture.references {
        rules.insert_reference(reference)?;
    }
    for assumption in fixture.assumptions {
        rules.insert_assumption(assumption)?;
    }
    let engine = CalcEngine::new(EngineStores::in_memory(rules), fixture.config)?;

    // Authored fixtures may leave hashes empty; declared hashes are kept so
    // validation still catches edits.
    let mut sealed = Vec::with_capacity(fixture.ruleset.rules.len());
    for mut rule in fixture.ruleset.rules {
        if rule.content_hash.is_empty() {
            rule.content_hash = rule.compute_content_hash()?;
        }
        sealed.push(rule);
    }
    let id = fixture.ruleset.id;
    engine.publish_ruleset(RulesetArtifact::new(id.clone(), fixture.ruleset.description, sealed)?)?;
    let report = match engine.validate_ruleset(&id) {
        Ok(report) => report,
        Err(err) if err.kind() == "ruleset_validation_failed" => {
            let stored = engine.publisher().get(&id)?.last_validation;
            return Ok(json!({ "ruleset_id": id, "validation": stored }));
        }
        Err(err) => return Err(err),
    };
    engine.activate_ruleset(&id, None)?;
    info!(ruleset_id = %id, "fixture ruleset active");

    let mut outputs = Vec::with_capacity(fixture.requests.len());
    for (index, request) in fixture.requests.iter().enumerate() {
        let output = match engine.run(request) {
            Ok(outcome) => {
                let mut value = serde_json::to_value(&outcome)?;
                if args.explain {
                    let chains: Vec<serde_json::Value> = outcome
                        .facts
                        .iter()
                        .map(|fact| match engine.explain(fact.id) {
                            Ok(chain) => serde_json::to_value(chain).unwrap_or_default(),
                            Err(e) => serde_json::to_value(e.report()).unwrap_or_default(),
                        })
                        .collect();
                    value["provenance"] = serde_json::Value::Array(chains);
                }
                RequestOutput {
                    index,
                    outcome: Some(value),
                    error: None,
                }
            }
            Err(e) => RequestOutput {
                index,
                outcome: None,
                error: Some(e.report()),
            },
        };
        outputs.push(output);
    }

    Ok(json!({ "ruleset_id": id, "validation": report, "results": outputs }))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = match parse_args() {
        Ok(Some(args)) => args,
        Ok(None) => {
            usage();
            return ExitCode::SUCCESS;
        }
        Err(message) => {
            eprintln!("error: {message}");
            eprintln!("run with --help for usage");
            return ExitCode::from(2);
        }
    };

    match run(&args) {
        Ok(output) => match serde_json::to_string_pretty(&output) {
            Ok(text) => {
                println!("{text}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("error: {e}");
                ExitCode::FAILURE
            }
        },
        Err(err) => {
            error!(kind = err.kind(), error = %err, "fixture run failed");
            eprintln!("error [{}]: {err}", err.kind());
            eprintln!("hint: {}", err.remediation());
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos/au_fy2025.json")
    }

    #[test]
    fn demo_fixture_runs_every_request() {
        let output = run(&Args {
            fixture: demo(),
            explain: true,
        })
        .unwrap();

        assert_eq!(output["validation"]["passed"], true);
        let results = output["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        let first = &results[0]["outcome"];
        let net = first["facts"]
            .as_array()
            .unwrap()
            .iter()
            .find(|f| f["topic"] == "pit.net_tax")
            .unwrap();
        assert_eq!(net["value"]["amount"], "22788.00");
        assert_eq!(
            first["provenance"].as_array().unwrap().len(),
            first["facts"].as_array().unwrap().len()
        );
        assert!(results[1]["error"].is_null());
    }

    #[test]
    fn missing_fixture_is_an_error() {
        let err = run(&Args {
            fixture: PathBuf::from("does/not/exist.json"),
            explain: false,
        })
        .unwrap_err();
        assert_eq!(err.kind(), "internal");
    }
}
