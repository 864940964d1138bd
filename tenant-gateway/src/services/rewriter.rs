//! Tenant matcher injection into PromQL.
//!
//! `QueryRewriter` is the seam the request pipeline depends on.
//! `PromqlRewriter` implements it on top of a full PromQL parser: the
//! expression is parsed into an AST, the tenant matcher is ANDed into every
//! vector selector, and the AST is rendered back to text. The rendered text
//! is parsed again and must describe the same selectors, every one of them
//! scoped. Anything that cannot be parsed, walked or rendered faithfully is
//! rejected.

use promql_parser::label::{MatchOp, Matcher};
use promql_parser::parser::{self, Expr, VectorSelector};

use crate::models::TenantMatcher;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RewriteError {
    #[error("failed to parse expression: {0}")]
    Parse(String),

    #[error("expression is not a series selector: {0}")]
    NotSelector(String),

    #[error("unsupported expression: {0}")]
    Unsupported(String),

    #[error("expression cannot be rendered with the tenant matcher intact: {0}")]
    Unrenderable(String),
}

/// Adds a mandatory matcher to a query-language expression.
pub trait QueryRewriter: Send + Sync {
    /// Scope a full query expression (the `query` parameter).
    fn inject(&self, expression: &str, matcher: &TenantMatcher) -> Result<String, RewriteError>;

    /// Scope a single series selector (one `match[]` value).
    fn inject_selector(
        &self,
        selector: &str,
        matcher: &TenantMatcher,
    ) -> Result<String, RewriteError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PromqlRewriter;

impl QueryRewriter for PromqlRewriter {
    fn inject(&self, expression: &str, matcher: &TenantMatcher) -> Result<String, RewriteError> {
        let mut expr = parser::parse(expression).map_err(RewriteError::Parse)?;
        let enforced = enforced_matcher(matcher);
        visit_selectors_mut(&mut expr, &mut |vs| enforce(vs, &enforced))?;
        render(expr, &enforced, expression)
    }

    fn inject_selector(
        &self,
        selector: &str,
        matcher: &TenantMatcher,
    ) -> Result<String, RewriteError> {
        let mut expr = parser::parse(selector).map_err(RewriteError::Parse)?;
        let enforced = enforced_matcher(matcher);
        match &mut expr {
            Expr::VectorSelector(vs) => enforce(vs, &enforced),
            _ => return Err(RewriteError::NotSelector(selector.to_string())),
        }
        render(expr, &enforced, selector)
    }
}

enum NodeMut<'a> {
    Selector(&'a mut VectorSelector),
    Text(&'a mut String),
}

/// Call `f` on every vector selector in `expr`, including those inside
/// range selectors, subqueries, function arguments, aggregations and both
/// sides of binary operations.
pub fn visit_selectors_mut<F>(expr: &mut Expr, f: &mut F) -> Result<(), RewriteError>
where
    F: FnMut(&mut VectorSelector),
{
    visit_mut(expr, &mut |node| {
        if let NodeMut::Selector(vs) = node {
            f(vs)
        }
    })
}

fn visit_mut<F>(expr: &mut Expr, f: &mut F) -> Result<(), RewriteError>
where
    F: FnMut(NodeMut<'_>),
{
    match expr {
        Expr::VectorSelector(vs) => f(NodeMut::Selector(vs)),
        Expr::MatrixSelector(ms) => f(NodeMut::Selector(&mut ms.vs)),
        Expr::Aggregate(agg) => {
            visit_mut(&mut agg.expr, f)?;
            if let Some(param) = agg.param.as_mut() {
                visit_mut(param, f)?;
            }
        }
        Expr::Unary(unary) => visit_mut(&mut unary.expr, f)?,
        Expr::Binary(binary) => {
            visit_mut(&mut binary.lhs, f)?;
            visit_mut(&mut binary.rhs, f)?;
        }
        Expr::Paren(paren) => visit_mut(&mut paren.expr, f)?,
        Expr::Subquery(subquery) => visit_mut(&mut subquery.expr, f)?,
        Expr::Call(call) => {
            for arg in call.args.args.iter_mut() {
                visit_mut(arg, f)?;
            }
        }
        Expr::StringLiteral(literal) => f(NodeMut::Text(&mut literal.val)),
        Expr::NumberLiteral(_) => {}
        // Extension nodes are opaque to us, so they cannot be scoped.
        #[allow(unreachable_patterns)]
        other => {
            return Err(RewriteError::Unsupported(format!("{:?}", other)));
        }
    }
    Ok(())
}

/// The conjunctions a selector matches: its `or` alternatives when it has
/// any, otherwise its plain matcher list.
pub fn matcher_groups(vs: &VectorSelector) -> Vec<&Vec<Matcher>> {
    let matchers = &vs.matchers;
    let mut groups: Vec<&Vec<Matcher>> = matchers.or_matchers.iter().collect();
    if groups.is_empty() || !matchers.matchers.is_empty() {
        groups.push(&matchers.matchers);
    }
    groups
}

fn enforced_matcher(matcher: &TenantMatcher) -> Matcher {
    Matcher {
        op: MatchOp::Equal,
        name: matcher.label.to_string(),
        value: matcher.value.as_str().to_string(),
    }
}

/// AND the tenant matcher into every conjunction of a selector. A
/// client-supplied `tenantId` matcher stays in place next to the enforced
/// one; an identical one is not duplicated.
fn enforce(vs: &mut VectorSelector, enforced: &Matcher) {
    let matchers = &mut vs.matchers;
    if matchers.or_matchers.is_empty() || !matchers.matchers.is_empty() {
        add_once(&mut matchers.matchers, enforced);
    }
    for group in matchers.or_matchers.iter_mut() {
        add_once(group, enforced);
    }
}

fn add_once(matchers: &mut Vec<Matcher>, enforced: &Matcher) {
    if !matchers.iter().any(|m| is_enforced(m, enforced)) {
        matchers.push(enforced.clone());
    }
}

fn is_enforced(m: &Matcher, enforced: &Matcher) -> bool {
    matches!(m.op, MatchOp::Equal) && m.name == enforced.name && m.value == enforced.value
}

/// What a scoped expression means for isolation: its selectors' matchers
/// and its string arguments, in walk order.
#[derive(Debug, PartialEq, Eq)]
struct Shape {
    selectors: Vec<(Option<String>, Vec<Vec<(String, &'static str, String)>>)>,
    strings: Vec<String>,
}

impl Shape {
    fn of(expr: &mut Expr) -> Result<Self, RewriteError> {
        let mut shape = Shape {
            selectors: Vec::new(),
            strings: Vec::new(),
        };
        visit_mut(expr, &mut |node| match node {
            NodeMut::Selector(vs) => {
                let groups = matcher_groups(vs)
                    .into_iter()
                    .map(|group| {
                        let mut group: Vec<_> = group
                            .iter()
                            .map(|m| (m.name.clone(), op_symbol(&m.op), m.value.clone()))
                            .collect();
                        group.sort();
                        group
                    })
                    .collect();
                shape.selectors.push((vs.name.clone(), groups));
            }
            NodeMut::Text(text) => shape.strings.push(text.clone()),
        })?;
        Ok(shape)
    }

    fn is_scoped(&self, enforced: &Matcher) -> bool {
        let wanted = (enforced.name.clone(), "=", enforced.value.clone());
        self.selectors
            .iter()
            .all(|(_, groups)| groups.iter().all(|group| group.contains(&wanted)))
    }
}

fn op_symbol(op: &MatchOp) -> &'static str {
    match op {
        MatchOp::Equal => "=",
        MatchOp::NotEqual => "!=",
        MatchOp::Re(_) => "=~",
        MatchOp::NotRe(_) => "!~",
        #[allow(unreachable_patterns)]
        _ => "?",
    }
}

/// Render a scoped AST and confirm the text parses back to the same scoped
/// selectors. The parser's printer writes label values and strings between
/// double quotes verbatim, so values holding quotes or backslashes are
/// re-escaped before a second attempt.
fn render(mut expr: Expr, enforced: &Matcher, original: &str) -> Result<String, RewriteError> {
    let expected = Shape::of(&mut expr)?;
    if !expected.is_scoped(enforced) {
        return Err(RewriteError::Unrenderable(original.to_string()));
    }

    let verbatim = expr.to_string();
    if renders_as(&verbatim, &expected, &expr) {
        return Ok(verbatim);
    }

    visit_mut(&mut expr, &mut |node| match node {
        NodeMut::Selector(vs) => {
            let matchers = &mut vs.matchers;
            for m in matchers
                .matchers
                .iter_mut()
                .chain(matchers.or_matchers.iter_mut().flatten())
            {
                m.value = escape(&m.value);
            }
        }
        NodeMut::Text(text) => *text = escape(text),
    })?;
    let escaped = expr.to_string();
    if renders_as(&escaped, &expected, &expr) {
        return Ok(escaped);
    }

    tracing::warn!(expression = %original, "Scoped expression did not survive rendering");
    Err(RewriteError::Unrenderable(original.to_string()))
}

fn renders_as(text: &str, expected: &Shape, rendered_from: &Expr) -> bool {
    let Ok(mut reparsed) = parser::parse(text) else {
        return false;
    };
    let same_kind = matches!(reparsed, Expr::VectorSelector(_))
        == matches!(rendered_from, Expr::VectorSelector(_));
    same_kind && Shape::of(&mut reparsed).map_or(false, |shape| &shape == expected)
}

/// Escape a value for a double-quoted PromQL string.
fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TenantId;

    type Group = Vec<(String, String, String)>;

    fn matcher(tenant: &str) -> TenantMatcher {
        TenantMatcher::for_tenant(TenantId::new(tenant).unwrap())
    }

    /// Every selector in `expr` as its `or` groups of (label, op, value).
    fn selectors(expr: &str) -> Vec<Vec<Group>> {
        let mut parsed = parser::parse(expr).expect("rewritten expression must parse");
        let mut out = Vec::new();
        visit_selectors_mut(&mut parsed, &mut |vs| {
            out.push(
                matcher_groups(vs)
                    .into_iter()
                    .map(|group| {
                        group
                            .iter()
                            .map(|m| {
                                (m.name.clone(), op_symbol(&m.op).to_string(), m.value.clone())
                            })
                            .collect()
                    })
                    .collect(),
            );
        })
        .unwrap();
        out
    }

    fn tenant_conditions(group: &[(String, String, String)]) -> Vec<&str> {
        group
            .iter()
            .filter(|(name, _, _)| name == "tenantId")
            .map(|(_, op, value)| {
                assert_eq!(op, "=");
                value.as_str()
            })
            .collect()
    }

    fn assert_all_scoped(expr: &str, tenant: &str) {
        let found = selectors(expr);
        assert!(!found.is_empty(), "no selectors in {expr}");
        for groups in &found {
            for group in groups {
                assert!(
                    tenant_conditions(group).contains(&tenant),
                    "group {group:?} in {expr} is not scoped to {tenant}"
                );
            }
        }
    }

    /// A hostile value either comes back as exactly one scoped selector
    /// carrying the value unchanged, or is refused.
    fn assert_value_stays_a_value(
        result: Result<String, RewriteError>,
        label: &str,
        value: &str,
    ) {
        match result {
            Ok(rewritten) => {
                let found = selectors(&rewritten);
                assert_eq!(found.len(), 1, "value escaped into a new selector: {rewritten}");
                assert_all_scoped(&rewritten, "acme");
                assert!(found[0]
                    .iter()
                    .flatten()
                    .any(|(n, _, v)| n == label && v == value));
            }
            Err(err) => assert!(matches!(err, RewriteError::Unrenderable(_)), "{err}"),
        }
    }

    #[test]
    fn scopes_bare_metric_name() {
        let rewritten = PromqlRewriter.inject("up", &matcher("acme")).unwrap();

        assert_all_scoped(&rewritten, "acme");
        assert!(rewritten.starts_with("up"));
        assert!(rewritten.contains(r#"tenantId="acme""#));
    }

    #[test]
    fn scopes_every_selector_in_nested_expression() {
        let expr = r#"sum by (job) (rate(http_requests_total{code="500"}[5m])) / on (job) group_left max_over_time((up{job!=""} or absent(node_load1))[10m:1m])"#;

        let rewritten = PromqlRewriter.inject(expr, &matcher("acme")).unwrap();

        let found = selectors(&rewritten);
        assert_eq!(found.len(), 3);
        assert_all_scoped(&rewritten, "acme");
    }

    #[test]
    fn scopes_aggregation_parameter_expressions() {
        let expr = "topk(scalar(count(up)), rate(node_cpu_seconds_total[1m]))";

        let rewritten = PromqlRewriter.inject(expr, &matcher("acme")).unwrap();

        assert_eq!(selectors(&rewritten).len(), 2);
        assert_all_scoped(&rewritten, "acme");
    }

    #[test]
    fn scopes_every_or_alternative_in_a_selector() {
        let rewritten = PromqlRewriter
            .inject(r#"up{job="a" or instance="b"}"#, &matcher("acme"))
            .unwrap();

        let found = selectors(&rewritten);
        assert_eq!(found.len(), 1);
        assert!(found[0].len() >= 2, "{rewritten}");
        assert_all_scoped(&rewritten, "acme");
    }

    #[test]
    fn scopes_every_or_alternative_in_a_match_selector() {
        let rewritten = PromqlRewriter
            .inject_selector(r#"{job="a" or instance="b"}"#, &matcher("acme"))
            .unwrap();

        let found = selectors(&rewritten);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].len(), 2);
        for group in &found[0] {
            assert_eq!(tenant_conditions(group), vec!["acme"]);
        }
    }

    #[test]
    fn number_literal_passes_through() {
        let rewritten = PromqlRewriter.inject("1 + 1", &matcher("acme")).unwrap();
        assert!(selectors(&rewritten).is_empty());
    }

    #[test]
    fn client_tenant_matcher_is_anded_not_overridden() {
        let rewritten = PromqlRewriter
            .inject(r#"up{tenantId="other"}"#, &matcher("acme"))
            .unwrap();

        let found = selectors(&rewritten);
        assert_eq!(found.len(), 1);
        let mut tenants = tenant_conditions(&found[0][0]);
        tenants.sort();
        assert_eq!(tenants, vec!["acme", "other"]);
    }

    #[test]
    fn client_regex_on_tenant_label_cannot_widen_scope() {
        let rewritten = PromqlRewriter
            .inject(r#"up{tenantId=~".+"}"#, &matcher("acme"))
            .unwrap();

        let group = &selectors(&rewritten)[0][0];
        assert!(group
            .iter()
            .any(|(n, op, v)| n == "tenantId" && op == "=" && v == "acme"));
        assert!(group.iter().any(|(n, op, _)| n == "tenantId" && op == "=~"));
    }

    #[test]
    fn quote_in_backtick_value_cannot_close_the_selector() {
        let value = r#""} or up{job!=""#;

        let result = PromqlRewriter.inject(r#"up{job!=`"} or up{job!="`}"#, &matcher("acme"));

        assert_value_stays_a_value(result, "job", value);
    }

    #[test]
    fn quote_in_single_quoted_value_cannot_close_the_selector() {
        let value = r#""} or up{job!=""#;

        let result = PromqlRewriter.inject(r#"up{job!='"} or up{job!="'}"#, &matcher("acme"));

        assert_value_stays_a_value(result, "job", value);
    }

    #[test]
    fn quote_in_match_selector_value_cannot_close_the_selector() {
        let value = r#""} or {job!=""#;

        let result =
            PromqlRewriter.inject_selector(r#"{job!=`"} or {job!="`}"#, &matcher("acme"));

        assert_value_stays_a_value(result, "job", value);
    }

    #[test]
    fn quote_in_function_string_argument_cannot_add_selectors() {
        let result = PromqlRewriter.inject(
            r#"label_replace(up, "dst", `") or (other`, "src", "(.*)")"#,
            &matcher("acme"),
        );

        match result {
            Ok(rewritten) => {
                assert_eq!(selectors(&rewritten).len(), 1);
                assert_all_scoped(&rewritten, "acme");
            }
            Err(err) => assert!(matches!(err, RewriteError::Unrenderable(_))),
        }
    }

    #[test]
    fn escaped_regex_value_keeps_its_meaning() {
        let input = r#"up{path=~"a\\.b"}"#;
        let original = selectors(input)[0][0]
            .iter()
            .find(|(n, _, _)| n == "path")
            .cloned()
            .unwrap();

        let rewritten = PromqlRewriter.inject(input, &matcher("acme")).unwrap();

        let group = &selectors(&rewritten)[0][0];
        assert!(group.contains(&original), "{rewritten}");
        assert_all_scoped(&rewritten, "acme");
    }

    #[test]
    fn rewriting_is_idempotent() {
        let once = PromqlRewriter
            .inject("rate(up[5m]) > 0", &matcher("acme"))
            .unwrap();
        let twice = PromqlRewriter.inject(&once, &matcher("acme")).unwrap();

        assert_eq!(once, twice);
        for groups in selectors(&twice) {
            for group in groups {
                assert_eq!(tenant_conditions(&group), vec!["acme"]);
            }
        }
    }

    #[test]
    fn rejects_malformed_expression() {
        let err = PromqlRewriter
            .inject("sum(rate(up[5m]", &matcher("acme"))
            .unwrap_err();
        assert!(matches!(err, RewriteError::Parse(_)));
    }

    #[test]
    fn rejects_empty_expression() {
        assert!(PromqlRewriter.inject("", &matcher("acme")).is_err());
    }

    #[test]
    fn scopes_default_selector() {
        let rewritten = PromqlRewriter
            .inject_selector(r#"{__name__=~".+"}"#, &matcher("acme"))
            .unwrap();

        let found = selectors(&rewritten);
        assert_eq!(found.len(), 1);
        let group = &found[0][0];
        assert!(group
            .iter()
            .any(|(n, op, v)| n == "__name__" && op == "=~" && v == ".+"));
        assert_eq!(tenant_conditions(group), vec!["acme"]);
    }

    #[test]
    fn selector_with_metric_name_is_scoped() {
        let rewritten = PromqlRewriter
            .inject_selector(r#"process_start_time_seconds{job="prometheus"}"#, &matcher("acme"))
            .unwrap();

        assert!(rewritten.starts_with("process_start_time_seconds"));
        assert_all_scoped(&rewritten, "acme");
    }

    #[test]
    fn selector_list_rejects_non_selector_expressions() {
        let err = PromqlRewriter
            .inject_selector("sum(up)", &matcher("acme"))
            .unwrap_err();
        assert!(matches!(err, RewriteError::NotSelector(_)));
    }

    #[test]
    fn escape_quotes_backslashes_and_control_characters() {
        assert_eq!(escape(r#"a"b\c"#), r#"a\"b\\c"#);
        assert_eq!(escape("line\nbreak\t"), r"line\nbreak\t");
        assert_eq!(escape("plain"), "plain");
    }
}
