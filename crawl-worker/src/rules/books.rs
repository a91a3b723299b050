//! Book-catalog crawl: tag index -> per-tag list pages -> book detail
//! records. The list page carries each book's title forward in the request
//! temp map so the detail record keeps it even when the detail page markup
//! omits it.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crawl_common::{Context, ParseFunc, ParseResult, Request, Result, RootFunc, Rule, RuleTree, Temp};

pub const TASK_NAME: &str = "book_list";

const BASE_URL: &str = "https://book.douban.com";

pub fn rule_tree() -> RuleTree {
    let mut trunk = HashMap::new();
    trunk.insert(
        "tag".to_string(),
        Rule::new(ParseFunc::Native(parse_tag)),
    );
    trunk.insert(
        "list".to_string(),
        Rule::new(ParseFunc::Native(parse_book_list)),
    );
    trunk.insert(
        "detail".to_string(),
        Rule::with_fields(
            ParseFunc::Native(parse_book_detail),
            &["title", "author", "pages", "publisher", "score", "price", "intro"],
        ),
    );
    RuleTree {
        root: Some(RootFunc::Native(root)),
        trunk,
    }
}

fn root() -> Result<Vec<Request>> {
    Ok(vec![Request {
        url: BASE_URL.to_string(),
        method: "GET".to_string(),
        task: TASK_NAME.to_string(),
        depth: 0,
        priority: 1,
        rule: "tag".to_string(),
        reload: false,
        temp: Temp::default(),
    }])
}

static TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<a href="([^"]+)" class="tag">([^<]+)</a>"#).expect("tag pattern"));

fn parse_tag(ctx: &Context<'_>) -> Result<ParseResult> {
    let body = ctx.body_str();
    let mut result = ParseResult::default();
    for caps in TAG_RE.captures_iter(&body) {
        result.requests.push(Request {
            url: format!("{BASE_URL}{}", &caps[1]),
            method: "GET".to_string(),
            task: ctx.request.task.clone(),
            depth: ctx.request.depth + 1,
            priority: 0,
            rule: "list".to_string(),
            reload: false,
            temp: Temp::default(),
        });
    }
    Ok(result)
}

static BOOK_LIST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<a.*?href="([^"]+)" title="([^"]+)""#).expect("list pattern"));

fn parse_book_list(ctx: &Context<'_>) -> Result<ParseResult> {
    let body = ctx.body_str();
    let mut result = ParseResult::default();
    for caps in BOOK_LIST_RE.captures_iter(&body) {
        let mut temp = Temp::default();
        temp.set("book_name", caps[2].to_string());
        result.requests.push(Request {
            url: caps[1].to_string(),
            method: "GET".to_string(),
            task: ctx.request.task.clone(),
            depth: ctx.request.depth + 1,
            priority: 0,
            rule: "detail".to_string(),
            reload: false,
            temp,
        });
    }
    Ok(result)
}

static AUTHOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<span class="pl"> ?author</span>:?[\d\D]*?<a.*?>([^<]+)</a>"#).expect("author pattern"));
static PUBLISHER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<span class="pl">publisher:</span>([^<]+)<br/>"#).expect("publisher pattern"));
static PAGES_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<span class="pl">pages:</span> ?([^<]+)<br/>"#).expect("pages pattern"));
static PRICE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<span class="pl">price:</span>([^<]+)<br/>"#).expect("price pattern"));
static SCORE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<strong class="ll rating_num " property="v:average">([^<]+)</strong>"#).expect("score pattern"));
static INTRO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<div class="intro">[\d\D]*?<p>([^<]+)</p></div>"#).expect("intro pattern"));

fn parse_book_detail(ctx: &Context<'_>) -> Result<ParseResult> {
    let body = ctx.body_str();
    let book_name = ctx
        .request
        .temp
        .get_str("book_name")
        .unwrap_or_default()
        .to_string();

    let mut data = HashMap::new();
    data.insert("title".to_string(), serde_json::json!(book_name));
    data.insert(
        "author".to_string(),
        serde_json::json!(extract(&body, &AUTHOR_RE)),
    );
    data.insert(
        "pages".to_string(),
        serde_json::json!(extract(&body, &PAGES_RE).trim().parse::<i64>().unwrap_or(0)),
    );
    data.insert(
        "publisher".to_string(),
        serde_json::json!(extract(&body, &PUBLISHER_RE)),
    );
    data.insert(
        "score".to_string(),
        serde_json::json!(extract(&body, &SCORE_RE)),
    );
    data.insert(
        "price".to_string(),
        serde_json::json!(extract(&body, &PRICE_RE)),
    );
    data.insert(
        "intro".to_string(),
        serde_json::json!(extract(&body, &INTRO_RE)),
    );

    Ok(ParseResult {
        requests: Vec::new(),
        items: vec![ctx.output(data)],
    })
}

fn extract(body: &str, re: &Regex) -> String {
    re.captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}
