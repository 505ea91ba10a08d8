use pretty_assertions::assert_eq;
use rustle_jinja::parser::TokenKind;
use rustle_jinja::types::ast::{Expr, NodeRef, Stmt, Template, MAX_NESTING};
use rustle_jinja::{annotate, dump, parse, parse_annotated, Environment, TemplateError};

fn spans(template: &Template) -> Vec<(&'static str, (usize, usize))> {
    let mut out = Vec::new();
    let mut stack = vec![NodeRef::Template(template)];
    while let Some(node) = stack.pop() {
        if let Some(span) = node.meta().tokens {
            out.push((node.kind_name(), span));
        }
        let children = node.children();
        stack.extend(children.into_iter().rev());
    }
    out
}

#[test]
fn test_every_node_is_inside_its_parent() {
    let source = "{% for a, b in items | dictsort if a %}{{ (a ~ b) | upper }}{% else %}-{% endfor %}";
    let (template, tokens) = parse_annotated(source, &Environment::new(), None).unwrap();
    let mut stack = vec![NodeRef::Template(&template)];
    while let Some(node) = stack.pop() {
        let (start, end) = node.meta().tokens.unwrap();
        assert!(end <= tokens.len());
        for child in node.children() {
            let (child_start, child_end) = child.meta().tokens.unwrap();
            assert!(start <= child_start && child_end <= end, "{}", child.kind_name());
            stack.push(child);
        }
    }
}

#[test]
fn test_statement_spans_cover_their_tags() {
    let source = "a{% set x = 1 %}b";
    let (template, tokens) = parse_annotated(source, &Environment::new(), None).unwrap();
    let (start, end) = template.body[1].meta().tokens.unwrap();
    assert_eq!(tokens.text(start..end), "{% set x = 1 %}");
    let pair = &template.body[1].meta().token_pairs[0];
    assert_eq!(pair.open.kind, TokenKind::BlockBegin);
    assert_eq!(pair.close.kind, TokenKind::BlockEnd);
}

#[test]
fn test_expression_span_text() {
    let source = "{{ foo.bar(1, x=2)[0] | join(',') }}";
    let (template, tokens) = parse_annotated(source, &Environment::new(), None).unwrap();
    let Stmt::Output(output) = &template.body[0] else {
        panic!("expected output");
    };
    let (start, end) = output.nodes[0].meta().tokens.unwrap();
    assert_eq!(tokens.text(start..end), "foo.bar(1, x=2)[0] | join(',')");
    let Expr::Filter(filter) = &output.nodes[0] else {
        panic!("expected filter");
    };
    let (start, end) = filter.node.as_ref().unwrap().meta().tokens.unwrap();
    assert_eq!(tokens.text(start..end), "foo.bar(1, x=2)[0]");
}

#[test]
fn test_one_pair_per_elif() {
    let mut source = String::from("{% if x == 0 %}0");
    for i in 1..=1000 {
        source.push_str(&format!("{{% elif x == {i} %}}{i}"));
    }
    source.push_str("{% endif %}");
    let (template, _) = parse_annotated(&source, &Environment::new(), None).unwrap();
    let Stmt::If(node) = &template.body[0] else {
        panic!("expected if");
    };
    assert_eq!(node.meta.token_pairs.len(), 1002);
    assert_eq!(node.elif_[999].meta.lineno, 1);
    assert_eq!(
        dump(&template, &Environment::new(), None).unwrap().unwrap(),
        source
    );
}

#[test]
fn test_chomps_differ_between_pairs() {
    let source = "{%- if x %}a{% endif -%}";
    let (template, _) = parse_annotated(source, &Environment::new(), None).unwrap();
    let pairs = &template.body[0].meta().token_pairs;
    assert_eq!(pairs[0].open.value_str, "{%-");
    assert_eq!(pairs[0].close.value_str, "%}");
    assert_eq!(pairs[1].open.value_str, "{%");
    assert_eq!(pairs[1].close.value_str, "-%}");
}

#[test]
fn test_delimiters_follow_environment() {
    let source = "<< x >>{{ y }}";
    let custom = Environment::new().with_variable_strings("<<", ">>");
    let (custom_tree, _) = parse_annotated(source, &custom, None).unwrap();
    let (default_tree, _) = parse_annotated(source, &Environment::new(), None).unwrap();
    let Stmt::Output(custom_output) = &custom_tree.body[0] else {
        panic!("expected output");
    };
    let Stmt::Output(default_output) = &default_tree.body[0] else {
        panic!("expected output");
    };
    assert_eq!(custom_output.meta.token_pairs[0].open.value_str, "<<");
    assert_eq!(default_output.meta.token_pairs[0].open.value_str, "{{");
}

#[test]
fn test_annotate_parsed_tree() {
    let env = Environment::new();
    let source = "{% macro m(a, b=2) %}{{ a + b }}{% endmacro %}";
    let mut template = parse(source, &env, None).unwrap();
    annotate(&mut template, &env, source).unwrap();
    let kinds: Vec<&str> = spans(&template).iter().map(|(kind, _)| *kind).collect();
    assert_eq!(
        kinds,
        vec!["Template", "Macro", "Name", "Name", "Const", "Output", "BinExpr", "Name", "Name"]
    );
}

#[test]
fn test_mismatched_source_is_internal_error() {
    let env = Environment::new();
    let mut template = parse("{{ a }}", &env, None).unwrap();
    let err = annotate(&mut template, &env, "{% if a %}{% endif %}").unwrap_err();
    assert!(err.is_internal());
}

#[test]
fn test_pairs_record_keyword_and_colon() {
    let source = "{% for x in y: %}{% if x %}{% elif z: %}{% endif %}{% endfor %}";
    let (template, _) = parse_annotated(source, &Environment::new(), None).unwrap();
    let Stmt::For(node) = &template.body[0] else {
        panic!("expected for");
    };
    let pairs: Vec<(&str, bool)> = node
        .meta
        .token_pairs
        .iter()
        .map(|p| (p.keyword.as_str(), p.colon))
        .collect();
    assert_eq!(pairs, vec![("for", true), ("endfor", false)]);

    let Stmt::If(inner) = &node.body[0] else {
        panic!("expected if");
    };
    assert_eq!(inner.meta.token_pairs.len(), 3);
    let elif = &inner.elif_[0].meta.token_pairs;
    assert_eq!(elif.len(), 1);
    assert_eq!(elif[0], inner.meta.token_pairs[1]);
    assert!(elif[0].colon);
}

#[test]
fn test_deeply_nested_ifs_fail_cleanly() {
    let source = format!("{}x{}", "{% if a %}".repeat(300), "{% endif %}".repeat(300));
    let err = parse_annotated(&source, &Environment::new(), None).unwrap_err();
    assert!(err.to_string().contains("nesting exceeds"), "{err}");
}

#[test]
fn test_long_operator_chain_round_trips() {
    let env = Environment::new();
    let source = format!("{{{{ (a{}) * b }}}}", " + a".repeat(1999));
    let (template, tokens) = parse_annotated(&source, &env, None).unwrap();
    let Stmt::Output(output) = &template.body[0] else {
        panic!("expected output");
    };
    let Expr::BinExpr(product) = &output.nodes[0] else {
        panic!("expected product");
    };
    let (start, end) = product.left.meta().tokens.unwrap();
    assert!(tokens.text(start..end).starts_with("(a + a"));
    assert!(tokens.text(start..end).ends_with("+ a)"));
    assert_eq!(dump(&template, &env, None).unwrap().unwrap(), source);
}

#[test]
fn test_long_filter_chain_fails_cleanly() {
    let env = Environment::new();
    let source = format!("{{{{ a{} }}}}", " | trim".repeat(300));
    parse(&source, &env, None).unwrap();
    let err = parse_annotated(&source, &env, None).unwrap_err();
    assert!(matches!(err, TemplateError::TooDeep { limit: MAX_NESTING }));
    assert!(!err.is_internal());
}
