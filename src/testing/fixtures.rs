//! Template fixtures for consistent testing across the codebase

/// Templates already written the way the dumper writes them, so an annotated
/// round trip reproduces them byte for byte.
pub fn canonical_templates() -> Vec<(&'static str, &'static str)> {
    vec![
        ("plain", "Hello {{ name }}!\n"),
        ("if_chain", "{% if a %}x{% elif b %}y{% else %}z{% endif %}"),
        (
            "for_loop",
            "{%- for item in items if item is defined -%}\n  {{ loop.index }}: {{ item | upper }}\n{%- else %}none{% endfor %}\n",
        ),
        ("set_and_filters", "{% set x = [1, 2, 3] %}{{ x[0] }}{{ x | join(', ') }}"),
        (
            "macro",
            "{% macro greet(name, greeting='hi') %}{{ greeting }} {{ name }}{% endmacro %}{{ greet('bob') }}",
        ),
        ("grouping", "{{ (a + b) * c }}"),
        ("conditional", "{{ a if b else c }}"),
        ("negations", "{{ x is not none and y not in z }}"),
        ("raw", "{% raw %}{{ untouched }}{% endraw %}"),
        (
            "comment_and_include",
            "{# comment #}{% include 'footer.html' ignore missing with context %}",
        ),
        ("call_args", "{{ foo(1, key=2, *args, **kwargs) }}"),
        ("block", "{% block content %}{{ super() }}{% endblock content %}"),
        ("filter_block", "{% filter upper %}text{% endfilter %}"),
        (
            "namespace",
            "{% set ns = namespace(count=0) %}{% set ns.count = ns.count + 1 %}",
        ),
        ("subscripts", "{{ x.0 }}{{ y['key'] }}{{ z[1:2] }}"),
        ("with", "{% with a = 1, b = 2 %}{{ a }}{% endwith %}"),
        (
            "imports",
            "{% from 'forms.html' import input as field, textarea %}{% import 'macros.html' as m without context %}",
        ),
        ("set_block", "{% set body | trim %}  content {% endset %}"),
        (
            "call_block",
            "{% call(user) list_users(users) %}{{ user }}{% endcall %}",
        ),
        (
            "tuple_target",
            "{% for k, v in d.items() %}{{ k }}={{ v }}{% endfor %}",
        ),
        ("unary_pow", "{{ -x ** 2 }}"),
        ("concat", "{{ 'a' ~ b ~ 'c' }}"),
        ("dict", "{{ {'a': 1, 'b': [2, 3]} }}"),
        ("tests", "{{ x is divisibleby 3 }}{{ x is sameas(none) }}"),
        (
            "loop_controls",
            "{% for i in r %}{% if i %}{% continue %}{% endif %}{% break %}{% endfor %}",
        ),
        ("empty_else", "{% if a %}x{% else %}{% endif %}"),
        ("autoescape", "{% autoescape true %}{{ x }}{% endautoescape %}"),
        ("extends", "{% extends 'base.html' %}"),
        ("chomps", "a  {{- x -}}  b\n{%- do items.append(1) +%}\n"),
    ]
}

/// An `if` with `branches` `elif` arms.
pub fn deep_elif_template(branches: usize) -> String {
    let mut source = String::from("{% if x == 0 %}zero");
    for i in 1..=branches {
        source.push_str(&format!("{{% elif x == {i} %}}{i}"));
    }
    source.push_str("{% endif %}");
    source
}
