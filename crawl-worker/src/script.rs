//! Scripted rule evaluation.
//!
//! Each evaluation builds a fresh rhai engine, binds the originating
//! request context, and registers the small helper API scripts use to emit
//! work: `add_requests` for Root scripts, `find_links` and `output_match`
//! for rule scripts. Nothing is shared between evaluations; a script
//! failure surfaces as an error on the request that triggered it and is
//! not retried.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rhai::{Array, Dynamic, Engine, Scope};

use crawl_common::{Context, Error, ParseResult, Request, Result, Temp};
use crawl_storage::DataCell;

/// Evaluate a Root script and collect the seed requests it registered via
/// `add_requests([#{url: .., rule: .., method: .., priority: ..}, ..])`.
pub fn eval_root(source: &str, task_name: &str) -> Result<Vec<Request>> {
    let collected: Arc<Mutex<Vec<Request>>> = Arc::new(Mutex::new(Vec::new()));

    let mut engine = new_engine();
    let sink = collected.clone();
    let task = task_name.to_string();
    engine.register_fn("add_requests", move |items: Array| {
        let mut requests = sink.lock().expect("script sink poisoned");
        for item in items {
            if let Some(request) = request_from_dynamic(&item, &task) {
                requests.push(request);
            }
        }
    });

    engine
        .run(source)
        .map_err(|e| Error::Script(e.to_string()))?;

    let mut collected = collected.lock().expect("script sink poisoned");
    Ok(std::mem::take(&mut *collected))
}

/// Evaluate a rule script against a fetched page.
///
/// The script sees `url` and `depth` in scope and emits through:
/// - `find_links(rule, pattern)`: capture group 1 of every `pattern` match
///   becomes a follow-up request routed to `rule` at depth+1;
/// - `output_match(pattern)`: if `pattern` matches anywhere, one record
///   with the page URL is produced.
pub fn eval_rule(source: &str, ctx: &Context<'_>) -> Result<ParseResult> {
    let body: Arc<str> = Arc::from(ctx.body_str().as_ref());
    let origin = ctx.request.clone();

    let requests: Arc<Mutex<Vec<Request>>> = Arc::new(Mutex::new(Vec::new()));
    let items: Arc<Mutex<Vec<DataCell>>> = Arc::new(Mutex::new(Vec::new()));

    let mut engine = new_engine();

    {
        let body = body.clone();
        let origin = origin.clone();
        let sink = requests.clone();
        engine.register_fn(
            "find_links",
            move |rule: &str, pattern: &str| -> std::result::Result<(), Box<rhai::EvalAltResult>> {
                let re = regex::Regex::new(pattern)
                    .map_err(|e| format!("invalid pattern {pattern:?}: {e}"))?;
                let mut sink = sink.lock().expect("script sink poisoned");
                for caps in re.captures_iter(&body) {
                    let Some(url) = caps.get(1) else { continue };
                    sink.push(Request {
                        url: url.as_str().to_string(),
                        method: "GET".to_string(),
                        task: origin.task.clone(),
                        depth: origin.depth + 1,
                        priority: 0,
                        rule: rule.to_string(),
                        reload: false,
                        temp: Temp::default(),
                    });
                }
                Ok(())
            },
        );
    }

    {
        let body = body.clone();
        let origin = origin.clone();
        let sink = items.clone();
        engine.register_fn(
            "output_match",
            move |pattern: &str| -> std::result::Result<bool, Box<rhai::EvalAltResult>> {
                let re = regex::Regex::new(pattern)
                    .map_err(|e| format!("invalid pattern {pattern:?}: {e}"))?;
                if !re.is_match(&body) {
                    return Ok(false);
                }
                let mut data = HashMap::new();
                data.insert(
                    "url".to_string(),
                    serde_json::Value::String(origin.url.clone()),
                );
                sink.lock().expect("script sink poisoned").push(DataCell {
                    task: origin.task.clone(),
                    rule: origin.rule.clone(),
                    url: origin.url.clone(),
                    time: Utc::now().to_rfc3339(),
                    data,
                });
                Ok(true)
            },
        );
    }

    let mut scope = Scope::new();
    scope.push("url", origin.url.clone());
    scope.push("depth", origin.depth as i64);

    engine
        .run_with_scope(&mut scope, source)
        .map_err(|e| Error::Script(e.to_string()))?;

    let requests = std::mem::take(&mut *requests.lock().expect("script sink poisoned"));
    let items = std::mem::take(&mut *items.lock().expect("script sink poisoned"));
    Ok(ParseResult { requests, items })
}

fn new_engine() -> Engine {
    let mut engine = Engine::new();
    // Scripts are untrusted input; keep runaway ones bounded.
    engine.set_max_operations(200_000);
    engine.set_max_expr_depths(64, 64);
    engine
}

/// Coerce one `#{url, rule, method, priority}` object map to a request.
fn request_from_dynamic(item: &Dynamic, task_name: &str) -> Option<Request> {
    let map = item.read_lock::<rhai::Map>()?;
    let url = map.get("url")?.clone().into_string().ok()?;
    let rule = map.get("rule")?.clone().into_string().ok()?;
    let method = map
        .get("method")
        .and_then(|m| m.clone().into_string().ok())
        .unwrap_or_else(|| "GET".to_string());
    let priority = map
        .get("priority")
        .and_then(|p| p.as_int().ok())
        .unwrap_or(0) as i32;

    Some(Request {
        url,
        method,
        task: task_name.to_string(),
        depth: 0,
        priority,
        rule,
        reload: false,
        temp: Temp::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_script_builds_seed_requests() {
        let source = r#"
            let seeds = [];
            for i in 1..3 {
                seeds.push(#{
                    url: "https://example.com/page/" + i,
                    rule: "list",
                    method: "GET",
                    priority: 1,
                });
            }
            add_requests(seeds);
        "#;

        let seeds = eval_root(source, "scripted").unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[0].url, "https://example.com/page/1");
        assert_eq!(seeds[0].task, "scripted");
        assert_eq!(seeds[0].rule, "list");
        assert!(seeds[0].high_priority());
    }

    #[test]
    fn rule_script_extracts_links_and_records() {
        let request = Request {
            url: "https://example.com/list".to_string(),
            method: "GET".to_string(),
            task: "scripted".to_string(),
            depth: 1,
            priority: 0,
            rule: "list".to_string(),
            reload: false,
            temp: Temp::default(),
        };
        let body = br#"<a href="https://example.com/item/7">seven</a> sunny"#;
        let ctx = Context {
            body,
            request: &request,
        };

        let source = r#"
            find_links("detail", "href=\"([^\"]+)\"");
            output_match("sunny");
        "#;
        let result = eval_rule(source, &ctx).unwrap();

        assert_eq!(result.requests.len(), 1);
        let link = &result.requests[0];
        assert_eq!(link.url, "https://example.com/item/7");
        assert_eq!(link.rule, "detail");
        assert_eq!(link.depth, 2);

        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].url, "https://example.com/list");
    }

    #[test]
    fn script_failure_is_an_error_not_a_panic() {
        assert!(matches!(
            eval_root("this is not rhai", "t"),
            Err(Error::Script(_))
        ));

        let request = Request {
            url: "https://example.com/".to_string(),
            method: "GET".to_string(),
            task: "t".to_string(),
            depth: 0,
            priority: 0,
            rule: "r".to_string(),
            reload: false,
            temp: Temp::default(),
        };
        let ctx = Context {
            body: b"",
            request: &request,
        };
        assert!(matches!(
            eval_rule(r#"find_links("r", "(unclosed");"#, &ctx),
            Err(Error::Script(_))
        ));
    }

    #[test]
    fn evaluations_do_not_share_state() {
        let source = r#"
            add_requests([#{url: "https://example.com/", rule: "list"}]);
        "#;
        let first = eval_root(source, "t").unwrap();
        let second = eval_root(source, "t").unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }
}
