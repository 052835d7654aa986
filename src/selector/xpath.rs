//! Path-style (XPath subset) selectors.
//!
//! Location paths with `/` and `//`, name tests, `*`, `.` and `..`, a grouped
//! expression `( ... )[n]`, and predicates built from positions, `last()`,
//! attribute and text comparisons, `contains()` and `starts-with()` joined by `and`.

use crate::dom::{Document, Element};
use crate::error::BlockError;
use std::collections::HashMap;

type Result<T> = std::result::Result<T, BlockError>;

fn invalid(expr: &str) -> BlockError {
    BlockError::InvalidSelector(expr.to_string())
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Attr(String),
    Text,
    Dot,
}

#[derive(Debug, Clone, PartialEq)]
enum Term {
    Position(usize),
    Last,
    Exists(Operand),
    Equals(Operand, String),
    NotEquals(Operand, String),
    Contains(Operand, String),
    StartsWith(Operand, String),
}

type Predicate = Vec<Term>;

#[derive(Debug, Clone, PartialEq)]
enum NodeTest {
    Name(String),
    Any,
    Parent,
    SelfNode,
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    descendant: bool,
    test: NodeTest,
    predicates: Vec<Predicate>,
}

/// Context node: the document root or an element.
#[derive(Clone, PartialEq)]
enum Node {
    Root,
    El(Element),
}

/// A parsed path expression.
#[derive(Debug, Clone, PartialEq)]
pub struct XPath {
    steps: Vec<Step>,
    group_predicates: Vec<Predicate>,
}

impl XPath {
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err(invalid(expr));
        }
        if trimmed.starts_with('(') {
            let close = find_closing(trimmed, 0, '(', ')').ok_or_else(|| invalid(expr))?;
            let steps = parse_steps(&trimmed[1..close]).map_err(|_| invalid(expr))?;
            let (group_predicates, rest) = parse_predicates(&trimmed[close + 1..])?;
            if !rest.trim().is_empty() {
                return Err(invalid(expr));
            }
            return Ok(Self {
                steps,
                group_predicates,
            });
        }
        Ok(Self {
            steps: parse_steps(trimmed).map_err(|_| invalid(expr))?,
            group_predicates: Vec::new(),
        })
    }

    /// Matching elements in document order.
    pub fn evaluate(&self, document: &Document) -> Vec<Element> {
        let order: HashMap<usize, usize> = document
            .elements()
            .iter()
            .enumerate()
            .map(|(index, el)| (el.node_id(), index))
            .collect();

        let mut contexts = vec![Node::Root];
        for step in &self.steps {
            let mut next: Vec<Node> = Vec::new();
            for context in &contexts {
                let bases = if step.descendant {
                    self_and_descendants(document, context)
                } else {
                    vec![context.clone()]
                };
                for base in bases {
                    for node in apply_step(document, &base, step) {
                        if !next.contains(&node) {
                            next.push(node);
                        }
                    }
                }
            }
            sort_document_order(&mut next, &order);
            contexts = next;
        }

        let mut elements: Vec<Element> = contexts
            .into_iter()
            .filter_map(|node| match node {
                Node::El(el) => Some(el),
                Node::Root => None,
            })
            .collect();
        for predicate in &self.group_predicates {
            elements = filter_predicate(elements, predicate);
        }
        elements
    }
}

fn sort_document_order(nodes: &mut [Node], order: &HashMap<usize, usize>) {
    nodes.sort_by_key(|node| match node {
        Node::Root => 0,
        Node::El(el) => order.get(&el.node_id()).map(|i| i + 1).unwrap_or(usize::MAX),
    });
}

fn children(document: &Document, node: &Node) -> Vec<Element> {
    match node {
        Node::Root => document.top_level(),
        Node::El(el) => el.children(),
    }
}

fn self_and_descendants(document: &Document, node: &Node) -> Vec<Node> {
    let mut out = vec![node.clone()];
    let mut stack: Vec<Element> = children(document, node).into_iter().rev().collect();
    while let Some(el) = stack.pop() {
        stack.extend(el.children().into_iter().rev());
        out.push(Node::El(el));
    }
    out
}

fn apply_step(document: &Document, context: &Node, step: &Step) -> Vec<Node> {
    match &step.test {
        NodeTest::SelfNode => vec![context.clone()],
        NodeTest::Parent => match context {
            Node::Root => Vec::new(),
            Node::El(el) => vec![el.parent().map(Node::El).unwrap_or(Node::Root)],
        },
        test => {
            let mut candidates: Vec<Element> = children(document, context)
                .into_iter()
                .filter(|el| match test {
                    NodeTest::Name(name) => el.tag_name().eq_ignore_ascii_case(name),
                    _ => true,
                })
                .collect();
            for predicate in &step.predicates {
                candidates = filter_predicate(candidates, predicate);
            }
            candidates.into_iter().map(Node::El).collect()
        }
    }
}

fn filter_predicate(candidates: Vec<Element>, predicate: &Predicate) -> Vec<Element> {
    let size = candidates.len();
    candidates
        .into_iter()
        .enumerate()
        .filter(|(index, el)| predicate.iter().all(|term| term_holds(term, el, index + 1, size)))
        .map(|(_, el)| el)
        .collect()
}

fn operand_value(operand: &Operand, el: &Element) -> Option<String> {
    match operand {
        Operand::Attr(name) => el.attribute(name),
        Operand::Text => Some(el.own_text()),
        Operand::Dot => Some(el.inner_text()),
    }
}

fn term_holds(term: &Term, el: &Element, position: usize, size: usize) -> bool {
    match term {
        Term::Position(n) => position == *n,
        Term::Last => position == size,
        Term::Exists(Operand::Text) => !el.own_text().is_empty(),
        Term::Exists(operand) => operand_value(operand, el).is_some(),
        Term::Equals(operand, value) => operand_value(operand, el).as_deref() == Some(value.as_str()),
        Term::NotEquals(operand, value) => operand_value(operand, el)
            .map(|v| v != *value)
            .unwrap_or(false),
        Term::Contains(operand, value) => operand_value(operand, el)
            .map(|v| v.contains(value.as_str()))
            .unwrap_or(false),
        Term::StartsWith(operand, value) => operand_value(operand, el)
            .map(|v| v.starts_with(value.as_str()))
            .unwrap_or(false),
    }
}

/// Index of the delimiter closing the one at `open`, skipping quoted text.
fn find_closing(src: &str, open: usize, open_ch: char, close_ch: char) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (index, ch) in src.char_indices().skip_while(|(i, _)| *i < open) {
        if let Some(q) = quote {
            if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => quote = Some(ch),
            c if c == open_ch => depth += 1,
            c if c == close_ch => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(index);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_steps(path: &str) -> Result<Vec<Step>> {
    let mut steps = Vec::new();
    let mut rest = path.trim();
    let mut first = true;

    while !rest.is_empty() {
        let descendant = if let Some(stripped) = rest.strip_prefix("//") {
            rest = stripped;
            true
        } else if let Some(stripped) = rest.strip_prefix('/') {
            rest = stripped;
            false
        } else if first {
            false
        } else {
            return Err(invalid(path));
        };
        first = false;

        let test_end = rest
            .find(|c: char| c == '[' || c == '/')
            .unwrap_or(rest.len());
        let test = match rest[..test_end].trim() {
            "" => return Err(invalid(path)),
            "*" => NodeTest::Any,
            "." => NodeTest::SelfNode,
            ".." => NodeTest::Parent,
            name if name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_') =>
            {
                NodeTest::Name(name.to_string())
            }
            _ => return Err(invalid(path)),
        };
        let (predicates, remaining) = parse_predicates(&rest[test_end..])?;
        steps.push(Step {
            descendant,
            test,
            predicates,
        });
        rest = remaining;
    }

    if steps.is_empty() {
        return Err(invalid(path));
    }
    Ok(steps)
}

/// Parses consecutive `[..]` predicates, returning them and the unparsed rest.
fn parse_predicates(src: &str) -> Result<(Vec<Predicate>, &str)> {
    let mut predicates = Vec::new();
    let mut rest = src;
    while rest.starts_with('[') {
        let close = find_closing(rest, 0, '[', ']').ok_or_else(|| invalid(src))?;
        predicates.push(parse_predicate(&rest[1..close])?);
        rest = &rest[close + 1..];
    }
    Ok((predicates, rest))
}

fn split_top_level<'a>(src: &'a str, separator: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0usize;
    let mut index = 0usize;
    while index < src.len() {
        let Some(ch) = src[index..].chars().next() else {
            break;
        };
        if let Some(q) = quote {
            if ch == q {
                quote = None;
            }
        } else {
            match ch {
                '\'' | '"' => quote = Some(ch),
                '(' | '[' => depth += 1,
                ')' | ']' => depth -= 1,
                _ if depth == 0 && src[index..].starts_with(separator) => {
                    parts.push(&src[start..index]);
                    index += separator.len();
                    start = index;
                    continue;
                }
                _ => {}
            }
        }
        index += ch.len_utf8();
    }
    parts.push(&src[start..]);
    parts
}

fn parse_predicate(src: &str) -> Result<Predicate> {
    split_top_level(src, " and ")
        .into_iter()
        .map(|term| parse_term(term.trim(), src))
        .collect()
}

fn parse_term(term: &str, src: &str) -> Result<Term> {
    if term.is_empty() {
        return Err(invalid(src));
    }
    if term.bytes().all(|b| b.is_ascii_digit()) {
        return match term.parse::<usize>() {
            Ok(n) if n > 0 => Ok(Term::Position(n)),
            _ => Err(invalid(src)),
        };
    }
    if term == "last()" {
        return Ok(Term::Last);
    }
    for (name, build) in [
        ("contains(", Term::Contains as fn(Operand, String) -> Term),
        ("starts-with(", Term::StartsWith as fn(Operand, String) -> Term),
    ] {
        if let Some(args) = term.strip_prefix(name).and_then(|a| a.strip_suffix(')')) {
            let parts = split_top_level(args, ",");
            if parts.len() != 2 {
                return Err(invalid(src));
            }
            return Ok(build(parse_operand(parts[0], src)?, parse_literal(parts[1], src)?));
        }
    }
    let comparison = split_top_level(term, "!=");
    if comparison.len() == 2 {
        return Ok(Term::NotEquals(
            parse_operand(comparison[0], src)?,
            parse_literal(comparison[1], src)?,
        ));
    }
    let comparison = split_top_level(term, "=");
    if comparison.len() == 2 {
        return Ok(Term::Equals(
            parse_operand(comparison[0], src)?,
            parse_literal(comparison[1], src)?,
        ));
    }
    Ok(Term::Exists(parse_operand(term, src)?))
}

fn parse_operand(raw: &str, src: &str) -> Result<Operand> {
    let raw = raw.trim();
    match raw {
        "text()" => Ok(Operand::Text),
        "." => Ok(Operand::Dot),
        _ => {
            let name = raw.strip_prefix('@').ok_or_else(|| invalid(src))?;
            if name.is_empty()
                || !name
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b':')
            {
                return Err(invalid(src));
            }
            Ok(Operand::Attr(name.to_ascii_lowercase()))
        }
    }
}

fn parse_literal(raw: &str, src: &str) -> Result<String> {
    let raw = raw.trim();
    for quote in ['\'', '"'] {
        if let Some(inner) = raw
            .strip_prefix(quote)
            .and_then(|r| r.strip_suffix(quote))
        {
            return Ok(inner.to_string());
        }
    }
    if !raw.is_empty() && raw.parse::<f64>().is_ok() {
        return Ok(raw.to_string());
    }
    Err(invalid(src))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::fixture::{ElementFixture, PageFixture};

    fn page() -> Document {
        PageFixture::new("https://xpath.test/")
            .element(
                ElementFixture::new("html").child(
                    ElementFixture::new("body")
                        .child(
                            ElementFixture::new("ul")
                                .id("menu")
                                .child(ElementFixture::new("li").text("Home").attr("data-k", "a1"))
                                .child(ElementFixture::new("li").text("Docs").attr("data-k", "b2"))
                                .child(ElementFixture::new("li").text("About")),
                        )
                        .child(
                            ElementFixture::new("ul")
                                .child(ElementFixture::new("li").text("Other")),
                        ),
                ),
            )
            .build()
    }

    fn texts(doc: &Document, expr: &str) -> Vec<String> {
        XPath::parse(expr)
            .unwrap()
            .evaluate(doc)
            .iter()
            .map(|el| el.own_text())
            .collect()
    }

    #[test]
    fn test_absolute_and_descendant_paths() {
        let doc = page();
        assert_eq!(texts(&doc, "/html/body/ul/li").len(), 4);
        assert_eq!(texts(&doc, "//li").len(), 4);
        assert_eq!(texts(&doc, "//ul[@id='menu']/li").len(), 3);
        assert_eq!(texts(&doc, "/html/*").len(), 1);
        assert!(texts(&doc, "/body").is_empty());
    }

    #[test]
    fn test_positional_predicates_are_per_parent() {
        let doc = page();
        assert_eq!(texts(&doc, "//li[1]"), vec!["Home", "Other"]);
        assert_eq!(texts(&doc, "(//li)[1]"), vec!["Home"]);
        assert_eq!(texts(&doc, "//ul[@id='menu']/li[last()]"), vec!["About"]);
    }

    #[test]
    fn test_text_and_function_predicates() {
        let doc = page();
        assert_eq!(texts(&doc, "//li[text()='Docs']"), vec!["Docs"]);
        assert_eq!(texts(&doc, "//li[contains(text(),'o')]").len(), 3);
        assert_eq!(texts(&doc, "//li[@data-k and starts-with(@data-k,'b')]"), vec!["Docs"]);
        assert_eq!(texts(&doc, "//li[@data-k!='a1']"), vec!["Docs"]);
        assert_eq!(texts(&doc, "//li[text()='Docs']/../li[3]"), vec!["About"]);
    }

    #[test]
    fn test_invalid_expressions() {
        for bad in ["", "/", "//li[", "//li[@]", "//li[text()=Docs]", "//li]", "(//li"] {
            assert!(XPath::parse(bad).is_err(), "{bad} should be rejected");
        }
    }
}
