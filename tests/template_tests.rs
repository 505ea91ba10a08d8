use pretty_assertions::assert_eq;
use rustle_jinja::types::ast::{Expr, Stmt};
use rustle_jinja::{check_whitespace, dump, parse_annotated, reformat, Environment, TemplateEngine};
use serde_json::json;
use std::collections::HashMap;

fn vars() -> HashMap<String, serde_json::Value> {
    HashMap::from([
        ("name".to_string(), json!("world")),
        ("items".to_string(), json!([1, 2, 3])),
        ("user".to_string(), json!({"admin": true, "tags": ["a", "b"]})),
    ])
}

#[test]
fn test_spacing_fix_renders_the_same() {
    let engine = TemplateEngine::new(&Environment::new()).unwrap();
    for text in [
        "{{name|upper}}{%if items%}{{items|join(',')}}{%endif%}",
        "{{ items[0:2]|sum }}-{{-1+items|length}}",
        "{%for t in user.tags%}{{loop.index}}={{t}} {%endfor%}",
    ] {
        let reformatted = check_whitespace(text).reformatted;
        assert_ne!(reformatted, text);
        assert!(
            engine.renders_equivalent(text, &reformatted, &vars()).unwrap(),
            "{text} -> {reformatted}"
        );
    }
}

#[test]
fn test_reformat_renders_the_same() {
    let env = Environment::new()
        .with_trim_blocks(true)
        .with_lstrip_blocks(true);
    let engine = TemplateEngine::new(&env).unwrap();
    let source = "<ul>\n  {% for x in items %}\n  <li>{{ x }}</li>\n  {% endfor %}\n</ul>\n";
    let formatted = reformat(source, &env).unwrap();
    assert!(engine.renders_equivalent(source, &formatted, &vars()).unwrap());
    assert_eq!(
        engine.render_string(&formatted, &vars()).unwrap(),
        "<ul>\n  <li>1</li>\n  <li>2</li>\n  <li>3</li>\n</ul>"
    );
}

#[test]
fn test_edited_tree_renders() {
    let env = Environment::new();
    let source = "{% set greeting = 'hi' %}{{ greeting }} {{ name }}";
    let (mut template, _) = parse_annotated(source, &env, None).unwrap();
    let Stmt::Output(output) = &mut template.body[1] else {
        panic!("expected output");
    };
    output.nodes[2] = Expr::filter(Expr::name("name"), "upper", vec![]);
    let text = dump(&template, &env, None).unwrap().unwrap();
    assert_eq!(text, "{% set greeting = 'hi' %}{{ greeting }} {{ name | upper }}");

    let engine = TemplateEngine::new(&env).unwrap();
    assert_eq!(engine.render_string(&text, &vars()).unwrap(), "hi WORLD");
}

#[test]
fn test_render_error_is_reported() {
    let engine = TemplateEngine::new(&Environment::new()).unwrap();
    let err = engine
        .render_string("{{ name | mandatory }}{{ nope | mandatory('needed') }}", &vars())
        .unwrap_err();
    assert!(err.to_string().contains("needed"));
}
