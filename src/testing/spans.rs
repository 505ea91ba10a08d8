//! Structural checks over annotated trees

use crate::types::ast::{NodeRef, Template};

/// Asserts that every node carries a span and that each child span lies
/// within its parent's.
pub fn assert_spans_contained(template: &Template) {
    let mut stack = vec![NodeRef::Template(template)];
    while let Some(node) = stack.pop() {
        let (start, end) = node
            .meta()
            .tokens
            .unwrap_or_else(|| panic!("{} has no token span", node.kind_name()));
        assert!(start <= end, "{} span is reversed", node.kind_name());
        for child in node.children() {
            let (child_start, child_end) = child
                .meta()
                .tokens
                .unwrap_or_else(|| panic!("{} has no token span", child.kind_name()));
            assert!(
                start <= child_start && child_end <= end,
                "{} ({child_start}, {child_end}) escapes {} ({start}, {end})",
                child.kind_name(),
                node.kind_name(),
            );
            stack.push(child);
        }
    }
}

/// Number of nodes in the tree, the root included.
pub fn count_nodes(template: &Template) -> usize {
    let mut stack = vec![NodeRef::Template(template)];
    let mut count = 0;
    while let Some(node) = stack.pop() {
        count += 1;
        stack.extend(node.children());
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{dump, parse_annotated, Environment};
    use crate::testing::fixtures::{canonical_templates, deep_elif_template};
    use crate::testing::helpers::{assert_round_trip, assert_template_error, within};
    use crate::types::ast::Stmt;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn test_fixture_spans_are_contained() {
        let env = Environment::new();
        for (name, source) in canonical_templates() {
            let (template, tokens) = parse_annotated(source, &env, Some(name)).unwrap();
            assert_eq!(template.meta.tokens, Some((0, tokens.len())), "{name}");
            assert_spans_contained(&template);
            assert!(count_nodes(&template) > 1, "{name}");
        }
    }

    #[test]
    fn test_fixtures_round_trip() {
        let env = Environment::new();
        for (_, source) in canonical_templates() {
            assert_round_trip(source, &env);
        }
    }

    #[test]
    fn test_deep_elif_chain() {
        let env = Environment::new();
        let source = deep_elif_template(1000);
        let (template, _) = within(Duration::from_secs(30), || {
            parse_annotated(&source, &env, None).unwrap()
        });
        let Stmt::If(node) = &template.body[0] else {
            panic!("expected an if statement");
        };
        assert_eq!(node.elif_.len(), 1000);
        assert_eq!(node.meta.token_pairs.len(), 1002);
        assert_spans_contained(&template);
        assert_eq!(dump(&template, &env, None).unwrap().unwrap(), source);
    }

    #[test]
    fn test_unclosed_block_reports_expected_tags() {
        let env = Environment::new();
        assert_template_error(
            parse_annotated("{% if x %}never closed", &env, Some("open.j2")),
            "Jinja was looking for the following tags",
        );
    }
}
