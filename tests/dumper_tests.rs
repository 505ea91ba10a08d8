use pretty_assertions::assert_eq;
use rustle_jinja::types::ast::*;
use rustle_jinja::{dump, parse, parse_annotated, reformat, Environment, TemplateError};

fn dump_string(template: &Template, env: &Environment) -> String {
    dump(template, env, None).unwrap().unwrap()
}

fn fresh(body: Vec<Stmt>) -> Template {
    Template {
        body,
        meta: Meta::default(),
    }
}

fn fresh_output(expr: Expr) -> Template {
    fresh(vec![Stmt::Output(Output {
        nodes: vec![expr],
        meta: Meta::default(),
    })])
}

fn store(name: &str) -> Expr {
    let mut expr = Expr::name(name);
    expr.set_ctx(Ctx::Store);
    expr
}

#[test]
fn test_unmodified_templates_round_trip() {
    let env = Environment::new();
    for source in [
        "{# a #}{{ x }}{# b #}",
        "{%- if x %}a{% endif -%}",
        "{% if x %}\n  {{ y }}\n{%- endif %}\n",
        "{% for x in y recursive %}{{ loop(x.children) }}{% endfor %}",
        "{{ a or b and not c }}",
        "{{ (a or b) and c }}",
        "{{ [1, 2][0:1] }}",
        "{{ (1,) }}",
        "{{ 1, 2 }}",
    ] {
        assert_eq!(reformat(source, &env).unwrap(), source);
    }
}

#[test]
fn test_trim_and_lstrip_blocks_round_trip() {
    let env = Environment::new()
        .with_trim_blocks(true)
        .with_lstrip_blocks(true);
    let source = "<ul>\n  {% for x in y %}\n  <li>{{ x }}</li>\n  {% endfor %}\n</ul>\n";
    assert_eq!(reformat(source, &env).unwrap(), source);
}

#[test]
fn test_line_statements_round_trip() {
    let env = Environment::new().with_line_statement_prefix("#");
    let source = "# for x in y\n{{ x }}\n# endfor\n";
    assert_eq!(reformat(source, &env).unwrap(), source);
}

#[test]
fn test_edited_expression_keeps_delimiters() {
    let env = Environment::new();
    let source = "{%- if x %}{{- y }}{% endif -%}";
    let (mut template, _) = parse_annotated(source, &env, None).unwrap();
    let Stmt::If(node) = &mut template.body[0] else {
        panic!("expected if");
    };
    let Stmt::Output(output) = &mut node.body[0] else {
        panic!("expected output");
    };
    output.nodes[0] = Expr::filter(Expr::name("y"), "int", vec![]);
    assert_eq!(
        dump_string(&template, &env),
        "{%- if x %}{{- y | int }}{% endif -%}"
    );
}

#[test]
fn test_fresh_statement_defaults() {
    let env = Environment::new();
    let template = fresh(vec![Stmt::For(For {
        target: Expr::Tuple(Tuple {
            items: vec![store("k"), store("v")],
            ctx: Ctx::Store,
            meta: Meta::default(),
        }),
        iter: Expr::Call(Call {
            node: Box::new(Expr::Getattr(Getattr {
                node: Box::new(Expr::name("d")),
                attr: "items".to_string(),
                meta: Meta::default(),
            })),
            args: CallArgs::default(),
            meta: Meta::default(),
        }),
        body: vec![Stmt::Output(Output {
            nodes: vec![Expr::name("k")],
            meta: Meta::default(),
        })],
        else_: vec![],
        test: None,
        recursive: false,
        meta: Meta::default(),
    })]);
    let text = dump_string(&template, &env);
    assert_eq!(text, "{% for k, v in d.items() %}{{ k }}{% endfor %}");
    assert_eq!(reformat(&text, &env).unwrap(), text);
}

#[test]
fn test_fresh_expressions_get_needed_parentheses() {
    let env = Environment::new();
    let cases = [
        (
            Expr::not(Expr::binary(BinOp::Or, Expr::name("a"), Expr::name("b"))),
            "{{ not (a or b) }}",
        ),
        (
            Expr::filter(
                Expr::CondExpr(CondExpr {
                    test: Box::new(Expr::name("b")),
                    expr1: Box::new(Expr::name("a")),
                    expr2: Some(Box::new(Expr::name("c"))),
                    meta: Meta::default(),
                }),
                "upper",
                vec![],
            ),
            "{{ (a if b else c) | upper }}",
        ),
        (
            Expr::binary(
                BinOp::Pow,
                Expr::binary(BinOp::Pow, Expr::name("a"), Expr::name("b")),
                Expr::name("c"),
            ),
            "{{ a ** b ** c }}",
        ),
        (
            Expr::Tuple(Tuple {
                items: vec![Expr::constant(ConstValue::Int(1))],
                ctx: Ctx::Load,
                meta: Meta::default(),
            }),
            "{{ (1,) }}",
        ),
        (Expr::string("it's"), "{{ \"it's\" }}"),
    ];
    for (expr, expected) in cases {
        let text = dump_string(&fresh_output(expr), &env);
        assert_eq!(text, expected);
        parse(&text, &env, None).unwrap();
    }
}

#[test]
fn test_fresh_nodes_use_environment_delimiters() {
    let env = Environment::new()
        .with_block_strings("<%", "%>")
        .with_variable_strings("<<", ">>");
    let template = fresh(vec![
        Stmt::Assign(Assign {
            target: store("a"),
            node: Expr::constant(ConstValue::Int(1)),
            meta: Meta::default(),
        }),
        Stmt::Output(Output {
            nodes: vec![Expr::name("a")],
            meta: Meta::default(),
        }),
    ]);
    assert_eq!(dump_string(&template, &env), "<% set a = 1 %>\n<< a >>");
}

#[test]
fn test_new_statement_in_annotated_tree() {
    let env = Environment::new();
    let source = "{% set a = 1 %}\n{{ a }}";
    let (mut template, _) = parse_annotated(source, &env, None).unwrap();
    template.body.insert(
        0,
        Stmt::Assign(Assign {
            target: store("b"),
            node: Expr::constant(ConstValue::Bool(true)),
            meta: Meta::default(),
        }),
    );
    assert_eq!(
        dump_string(&template, &env),
        "{% set b = true %}\n{% set a = 1 %}\n{{ a }}"
    );
}

#[test]
fn test_trailing_colon_round_trips() {
    let env = Environment::new().with_line_statement_prefix("%");
    let source = "% for x in y:\n{{ x }}\n% else:\nnone\n% endfor\n";
    assert_eq!(reformat(source, &env).unwrap(), source);

    let env = Environment::new();
    let source = "{% if a: %}1{% elif b : %}2{% endif %}";
    assert_eq!(
        reformat(source, &env).unwrap(),
        "{% if a: %}1{% elif b: %}2{% endif %}"
    );
}

#[test]
fn test_added_expression_keeps_other_chomps() {
    let env = Environment::new();
    let source = "x {{- a }} y {{ b -}} z";
    let (mut template, _) = parse_annotated(source, &env, None).unwrap();
    let Stmt::Output(output) = &mut template.body[0] else {
        panic!("expected output");
    };
    output.nodes.insert(0, Expr::name("c"));
    assert_eq!(
        dump_string(&template, &env),
        "{{ c }}x {{- a }} y {{ b -}} z"
    );
}

#[test]
fn test_elif_edits_keep_other_chomps() {
    let env = Environment::new();
    let source = "{%- if a -%} 1 {%- elif b -%} 2 {%- else -%} 3 {%- endif -%}";
    let (mut template, _) = parse_annotated(source, &env, None).unwrap();
    let Stmt::If(node) = &mut template.body[0] else {
        panic!("expected if");
    };
    node.elif_.push(If {
        test: Expr::name("c"),
        body: vec![Stmt::Output(Output {
            nodes: vec![Expr::TemplateData(TemplateData {
                data: "4".to_string(),
                meta: Meta::default(),
            })],
            meta: Meta::default(),
        })],
        elif_: vec![],
        else_: vec![],
        meta: Meta::default(),
    });
    assert_eq!(
        dump_string(&template, &env),
        "{%- if a -%} 1 {%- elif b -%} 2{% elif c %}4 {%- else -%} 3 {%- endif -%}"
    );

    let source = "{% if a %}1{% elif b -%} 2{% endif -%}\n";
    let (mut template, _) = parse_annotated(source, &env, None).unwrap();
    let Stmt::If(node) = &mut template.body[0] else {
        panic!("expected if");
    };
    node.elif_.clear();
    assert_eq!(dump_string(&template, &env), "{% if a %}1{% endif -%}\n");
}

#[test]
fn test_float_beyond_range() {
    let env = Environment::new();
    assert_eq!(reformat("{{ 1e400 }}", &env).unwrap(), "{{ 1e999 }}");
    assert_eq!(reformat("{{ 1e999 }}", &env).unwrap(), "{{ 1e999 }}");
    let template = fresh_output(Expr::constant(ConstValue::Float(f64::NEG_INFINITY)));
    assert_eq!(dump_string(&template, &env), "{{ -1e999 }}");
}

#[test]
fn test_nested_ifs_within_limit_round_trip() {
    let env = Environment::new();
    let source = format!("{}x{}", "{% if a %}".repeat(100), "{% endif %}".repeat(100));
    assert_eq!(reformat(&source, &env).unwrap(), source);
}

#[test]
fn test_deep_fresh_tree_is_refused() {
    let env = Environment::new();
    let mut sum = Expr::name("a");
    for _ in 0..2000 {
        sum = Expr::binary(BinOp::Add, sum, Expr::name("a"));
    }
    let text = dump_string(&fresh_output(sum), &env);
    assert_eq!(text.matches(" + ").count(), 2000);
    assert!(!text.contains('('));

    let mut expr = Expr::name("a");
    for _ in 0..200 {
        expr = Expr::binary(BinOp::Sub, Expr::name("a"), expr);
    }
    let err = dump(&fresh_output(expr), &env, None).unwrap_err();
    assert!(matches!(err, TemplateError::TooDeep { limit: MAX_NESTING }));

    let mut body = vec![Stmt::Output(Output {
        nodes: vec![Expr::name("x")],
        meta: Meta::default(),
    })];
    for _ in 0..200 {
        body = vec![Stmt::If(If {
            test: Expr::name("a"),
            body,
            elif_: vec![],
            else_: vec![],
            meta: Meta::default(),
        })];
    }
    let mut buffer = Vec::new();
    let err = dump(&fresh(body), &env, Some(&mut buffer)).unwrap_err();
    assert!(matches!(err, TemplateError::TooDeep { .. }));
    assert!(buffer.is_empty());
}
