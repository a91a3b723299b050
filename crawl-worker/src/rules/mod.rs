//! Built-in parse rule trees, registered by task name at startup. The
//! master ships task names only; the trees here are the canonical rule
//! definitions on every worker.

pub mod books;

use crawl_common::RuleTree;

/// Rule tree for a configured task name, if this build knows it.
pub fn builtin_tree(name: &str) -> Option<RuleTree> {
    match name {
        books::TASK_NAME => Some(books::rule_tree()),
        _ => None,
    }
}
