//! Structural (CSS subset) selectors.
//!
//! Supports type, universal, `#id`, `.class`, attribute conditions, the structural
//! pseudo-classes `:first-child`, `:last-child`, `:only-child`, `:nth-child(..)`,
//! the four combinators and comma-separated groups.

use crate::dom::{Document, Element};
use crate::error::BlockError;

type Result<T> = std::result::Result<T, BlockError>;

fn unsupported(selector: &str) -> BlockError {
    BlockError::InvalidSelector(selector.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SelectorAttrCondition {
    Exists { key: String },
    Eq { key: String, value: String },
    StartsWith { key: String, value: String },
    EndsWith { key: String, value: String },
    Contains { key: String, value: String },
    Includes { key: String, value: String },
    DashMatch { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SelectorPseudoClass {
    FirstChild,
    LastChild,
    OnlyChild,
    NthChild(NthChildSelector),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NthChildSelector {
    Exact(usize),
    Odd,
    Even,
    AnPlusB(i64, i64),
}

impl NthChildSelector {
    fn matches(&self, position: usize) -> bool {
        let position = position as i64;
        match self {
            NthChildSelector::Exact(n) => position == *n as i64,
            NthChildSelector::Odd => position % 2 == 1,
            NthChildSelector::Even => position % 2 == 0,
            NthChildSelector::AnPlusB(a, b) => {
                if *a == 0 {
                    return position == *b;
                }
                let diff = position - b;
                diff % a == 0 && diff / a >= 0
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SelectorStep {
    pub(crate) tag: Option<String>,
    pub(crate) universal: bool,
    pub(crate) id: Option<String>,
    pub(crate) classes: Vec<String>,
    pub(crate) attrs: Vec<SelectorAttrCondition>,
    pub(crate) pseudo_classes: Vec<SelectorPseudoClass>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SelectorCombinator {
    Descendant,
    Child,
    AdjacentSibling,
    GeneralSibling,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SelectorPart {
    pub(crate) step: SelectorStep,
    // Relation to previous (left) selector part.
    pub(crate) combinator: Option<SelectorCombinator>,
}

/// A parsed selector list (`a, b > c`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CssSelector {
    groups: Vec<Vec<SelectorPart>>,
}

impl CssSelector {
    pub fn parse(selector: &str) -> Result<Self> {
        Ok(Self {
            groups: parse_selector_groups(selector)?,
        })
    }

    pub fn matches(&self, element: &Element) -> bool {
        self.groups
            .iter()
            .any(|parts| matches_part(parts, parts.len() - 1, element))
    }

    /// Matching elements in document order.
    pub fn query_all(&self, document: &Document) -> Vec<Element> {
        document
            .elements()
            .into_iter()
            .filter(|el| self.matches(el))
            .collect()
    }
}

fn matches_part(parts: &[SelectorPart], index: usize, element: &Element) -> bool {
    let part = &parts[index];
    if !step_matches(&part.step, element) {
        return false;
    }
    if index == 0 {
        return true;
    }
    match part.combinator.unwrap_or(SelectorCombinator::Descendant) {
        SelectorCombinator::Child => element
            .parent()
            .map(|parent| matches_part(parts, index - 1, &parent))
            .unwrap_or(false),
        SelectorCombinator::Descendant => {
            let mut current = element.parent();
            while let Some(ancestor) = current {
                if matches_part(parts, index - 1, &ancestor) {
                    return true;
                }
                current = ancestor.parent();
            }
            false
        }
        SelectorCombinator::AdjacentSibling => preceding_siblings(element)
            .last()
            .map(|prev| matches_part(parts, index - 1, prev))
            .unwrap_or(false),
        SelectorCombinator::GeneralSibling => preceding_siblings(element)
            .iter()
            .any(|prev| matches_part(parts, index - 1, prev)),
    }
}

fn preceding_siblings(element: &Element) -> Vec<Element> {
    element
        .siblings()
        .into_iter()
        .take_while(|sibling| sibling != element)
        .collect()
}

fn step_matches(step: &SelectorStep, element: &Element) -> bool {
    if let Some(tag) = &step.tag {
        if !element.tag_name().eq_ignore_ascii_case(tag) {
            return false;
        }
    }
    if let Some(id) = &step.id {
        if element.attribute("id").as_deref() != Some(id.as_str()) {
            return false;
        }
    }
    if !step.classes.is_empty() {
        let classes = element.classes();
        if !step.classes.iter().all(|c| classes.contains(c)) {
            return false;
        }
    }
    if !step.attrs.iter().all(|cond| attr_matches(cond, element)) {
        return false;
    }
    if step.pseudo_classes.is_empty() {
        return true;
    }

    let siblings = element.siblings();
    let position = siblings
        .iter()
        .position(|sibling| sibling == element)
        .map(|p| p + 1)
        .unwrap_or(0);
    step.pseudo_classes.iter().all(|pseudo| match pseudo {
        SelectorPseudoClass::FirstChild => position == 1,
        SelectorPseudoClass::LastChild => position == siblings.len(),
        SelectorPseudoClass::OnlyChild => siblings.len() == 1,
        SelectorPseudoClass::NthChild(nth) => nth.matches(position),
    })
}

fn attr_matches(cond: &SelectorAttrCondition, element: &Element) -> bool {
    match cond {
        SelectorAttrCondition::Exists { key } => element.has_attribute(key),
        SelectorAttrCondition::Eq { key, value } => {
            element.attribute(key).as_deref() == Some(value.as_str())
        }
        SelectorAttrCondition::StartsWith { key, value } => element
            .attribute(key)
            .map(|v| !value.is_empty() && v.starts_with(value.as_str()))
            .unwrap_or(false),
        SelectorAttrCondition::EndsWith { key, value } => element
            .attribute(key)
            .map(|v| !value.is_empty() && v.ends_with(value.as_str()))
            .unwrap_or(false),
        SelectorAttrCondition::Contains { key, value } => element
            .attribute(key)
            .map(|v| !value.is_empty() && v.contains(value.as_str()))
            .unwrap_or(false),
        SelectorAttrCondition::Includes { key, value } => element
            .attribute(key)
            .map(|v| v.split_whitespace().any(|word| word == value))
            .unwrap_or(false),
        SelectorAttrCondition::DashMatch { key, value } => element
            .attribute(key)
            .map(|v| v == *value || v.starts_with(&format!("{}-", value)))
            .unwrap_or(false),
    }
}

pub(crate) fn parse_selector_chain(selector: &str) -> Result<Vec<SelectorPart>> {
    let selector = selector.trim();
    if selector.is_empty() {
        return Err(unsupported(selector));
    }

    let tokens = tokenize_selector(selector)?;
    let mut steps = Vec::new();
    let mut pending_combinator: Option<SelectorCombinator> = None;

    for token in tokens {
        let combinator = match token.as_str() {
            ">" => Some(SelectorCombinator::Child),
            "+" => Some(SelectorCombinator::AdjacentSibling),
            "~" => Some(SelectorCombinator::GeneralSibling),
            _ => None,
        };
        if let Some(combinator) = combinator {
            if pending_combinator.is_some() || steps.is_empty() {
                return Err(unsupported(selector));
            }
            pending_combinator = Some(combinator);
            continue;
        }

        let step = parse_selector_step(&token)?;
        let combinator = if steps.is_empty() {
            None
        } else {
            Some(
                pending_combinator
                    .take()
                    .unwrap_or(SelectorCombinator::Descendant),
            )
        };
        steps.push(SelectorPart { step, combinator });
    }

    if steps.is_empty() || pending_combinator.is_some() {
        return Err(unsupported(selector));
    }

    Ok(steps)
}

pub(crate) fn parse_selector_groups(selector: &str) -> Result<Vec<Vec<SelectorPart>>> {
    let groups = split_selector_groups(selector)?;
    let mut parsed = Vec::with_capacity(groups.len());
    for group in groups {
        parsed.push(parse_selector_chain(&group)?);
    }
    Ok(parsed)
}

/// Tracks `[]`/`()` nesting while scanning a selector.
#[derive(Default)]
struct Depth {
    bracket: usize,
    paren: usize,
}

impl Depth {
    fn track(&mut self, ch: char) -> bool {
        match ch {
            '[' => self.bracket += 1,
            '(' => self.paren += 1,
            ']' => {
                if self.bracket == 0 {
                    return false;
                }
                self.bracket -= 1;
            }
            ')' => {
                if self.paren == 0 {
                    return false;
                }
                self.paren -= 1;
            }
            _ => {}
        }
        true
    }

    fn top_level(&self) -> bool {
        self.bracket == 0 && self.paren == 0
    }
}

pub(crate) fn split_selector_groups(selector: &str) -> Result<Vec<String>> {
    let mut groups = Vec::new();
    let mut current = String::new();
    let mut depth = Depth::default();

    for ch in selector.chars() {
        if ch == ',' && depth.top_level() {
            let trimmed = current.trim();
            if trimmed.is_empty() {
                return Err(unsupported(selector));
            }
            groups.push(trimmed.to_string());
            current.clear();
            continue;
        }
        if !depth.track(ch) {
            return Err(unsupported(selector));
        }
        current.push(ch);
    }

    if !depth.top_level() {
        return Err(unsupported(selector));
    }

    let trimmed = current.trim();
    if trimmed.is_empty() {
        return Err(unsupported(selector));
    }
    groups.push(trimmed.to_string());
    Ok(groups)
}

pub(crate) fn tokenize_selector(selector: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut depth = Depth::default();

    for ch in selector.chars() {
        let top = depth.top_level();
        match ch {
            '>' | '+' | '~' if top => {
                if !current.trim().is_empty() {
                    tokens.push(current.trim().to_string());
                }
                current.clear();
                tokens.push(ch.to_string());
            }
            ch if ch.is_ascii_whitespace() && top => {
                if !current.trim().is_empty() {
                    tokens.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => {
                if !depth.track(ch) {
                    return Err(unsupported(selector));
                }
                current.push(ch);
            }
        }
    }

    if !depth.top_level() {
        return Err(unsupported(selector));
    }

    if !current.trim().is_empty() {
        tokens.push(current.trim().to_string());
    }

    Ok(tokens)
}

pub(crate) fn parse_selector_step(part: &str) -> Result<SelectorStep> {
    let part = part.trim();
    if part.is_empty() {
        return Err(unsupported(part));
    }

    let bytes = part.as_bytes();
    let mut i = 0usize;
    let mut step = SelectorStep::default();

    while i < bytes.len() {
        match bytes[i] {
            b'*' => {
                if step.universal {
                    return Err(unsupported(part));
                }
                step.universal = true;
                i += 1;
            }
            b'#' => {
                let Some((id, next)) = parse_selector_ident(part, i + 1) else {
                    return Err(unsupported(part));
                };
                if step.id.replace(id).is_some() {
                    return Err(unsupported(part));
                }
                i = next;
            }
            b'.' => {
                let Some((class_name, next)) = parse_selector_ident(part, i + 1) else {
                    return Err(unsupported(part));
                };
                step.classes.push(class_name);
                i = next;
            }
            b'[' => {
                let (attr, next) = parse_selector_attr_condition(part, i)?;
                step.attrs.push(attr);
                i = next;
            }
            b':' => {
                let Some((pseudo, next)) = parse_selector_pseudo(part, i) else {
                    return Err(unsupported(part));
                };
                step.pseudo_classes.push(pseudo);
                i = next;
            }
            _ => {
                if step.tag.is_some()
                    || step.id.is_some()
                    || !step.classes.is_empty()
                    || step.universal
                {
                    return Err(unsupported(part));
                }
                let Some((tag, next)) = parse_selector_ident(part, i) else {
                    return Err(unsupported(part));
                };
                step.tag = Some(tag.to_ascii_lowercase());
                i = next;
            }
        }
    }

    Ok(step)
}

pub(crate) fn parse_selector_pseudo(
    part: &str,
    start: usize,
) -> Option<(SelectorPseudoClass, usize)> {
    let start = start + 1;
    let tail = part.get(start..)?;

    for (name, pseudo) in [
        ("first-child", SelectorPseudoClass::FirstChild),
        ("last-child", SelectorPseudoClass::LastChild),
        ("only-child", SelectorPseudoClass::OnlyChild),
    ] {
        if let Some(rest) = tail.strip_prefix(name) {
            if rest.is_empty() || is_selector_continuation(rest.as_bytes().first()?) {
                return Some((pseudo, start + name.len()));
            }
        }
    }

    let rest = tail.strip_prefix("nth-child(")?;
    let close = rest.find(')')?;
    let nth = parse_nth_child_selector(&rest[..close])?;
    Some((
        SelectorPseudoClass::NthChild(nth),
        start + "nth-child(".len() + close + 1,
    ))
}

pub(crate) fn parse_nth_child_selector(raw: &str) -> Option<NthChildSelector> {
    let compact = raw
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();

    match compact.as_str() {
        "" => None,
        "odd" => Some(NthChildSelector::Odd),
        "even" => Some(NthChildSelector::Even),
        other if other.contains('n') => parse_nth_child_expression(other),
        other if other.starts_with('+') || other.starts_with('-') => None,
        other => match other.parse::<usize>().ok()? {
            0 => None,
            value => Some(NthChildSelector::Exact(value)),
        },
    }
}

pub(crate) fn parse_nth_child_expression(expr: &str) -> Option<NthChildSelector> {
    if expr.matches('n').count() != 1 {
        return None;
    }

    let n_pos = expr.find('n')?;
    let (a_part, rest) = expr.split_at(n_pos);
    let b_part = &rest[1..];

    let a = match a_part {
        "" => 1,
        "-" => -1,
        "+" => return None,
        _ => a_part.parse::<i64>().ok()?,
    };

    if b_part.is_empty() {
        return Some(NthChildSelector::AnPlusB(a, 0));
    }

    let (sign, raw_b) = if let Some(rest) = b_part.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = b_part.strip_prefix('-') {
        (-1, rest)
    } else {
        return None;
    };
    let b = raw_b.parse::<i64>().ok()?;
    Some(NthChildSelector::AnPlusB(a, b * sign))
}

pub(crate) fn is_selector_continuation(next: &u8) -> bool {
    matches!(next, b'.' | b'#' | b'[' | b':')
}

pub(crate) fn parse_selector_ident(src: &str, start: usize) -> Option<(String, usize)> {
    let bytes = src.as_bytes();
    if start >= bytes.len() || !is_selector_ident_char(bytes[start]) {
        return None;
    }
    let mut end = start + 1;
    while end < bytes.len() && is_selector_ident_char(bytes[end]) {
        end += 1;
    }
    Some((src.get(start..end)?.to_string(), end))
}

pub(crate) fn is_selector_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

fn skip_whitespace(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

pub(crate) fn parse_selector_attr_condition(
    src: &str,
    open_bracket: usize,
) -> Result<(SelectorAttrCondition, usize)> {
    let bytes = src.as_bytes();
    let mut i = skip_whitespace(bytes, open_bracket + 1);

    let key_start = i;
    while i < bytes.len() && is_selector_attr_name_char(bytes[i]) {
        i += 1;
    }
    if key_start == i {
        return Err(unsupported(src));
    }
    let key = src
        .get(key_start..i)
        .ok_or_else(|| unsupported(src))?
        .to_ascii_lowercase();

    i = skip_whitespace(bytes, i);
    if i >= bytes.len() {
        return Err(unsupported(src));
    }

    if bytes[i] == b']' {
        return Ok((SelectorAttrCondition::Exists { key }, i + 1));
    }

    let (op, next) = match bytes[i] {
        b'=' => (b'=', i + 1),
        op @ (b'^' | b'$' | b'*' | b'~' | b'|') if bytes.get(i + 1) == Some(&b'=') => {
            (op, i + 2)
        }
        _ => return Err(unsupported(src)),
    };

    i = skip_whitespace(bytes, next);
    let (value, after_value) = parse_selector_attr_value(src, i)?;
    i = skip_whitespace(bytes, after_value);
    if i >= bytes.len() || bytes[i] != b']' {
        return Err(unsupported(src));
    }

    let cond = match op {
        b'^' => SelectorAttrCondition::StartsWith { key, value },
        b'$' => SelectorAttrCondition::EndsWith { key, value },
        b'*' => SelectorAttrCondition::Contains { key, value },
        b'~' => SelectorAttrCondition::Includes { key, value },
        b'|' => SelectorAttrCondition::DashMatch { key, value },
        _ => SelectorAttrCondition::Eq { key, value },
    };

    Ok((cond, i + 1))
}

pub(crate) fn is_selector_attr_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b':'
}

pub(crate) fn parse_selector_attr_value(src: &str, start: usize) -> Result<(String, usize)> {
    let bytes = src.as_bytes();
    if start >= bytes.len() {
        return Err(unsupported(src));
    }

    if bytes[start] == b'"' || bytes[start] == b'\'' {
        let quote = bytes[start];
        let mut i = start + 1;
        while i < bytes.len() {
            if bytes[i] == b'\\' {
                i = (i + 2).min(bytes.len());
                continue;
            }
            if bytes[i] == quote {
                let raw = src.get(start + 1..i).ok_or_else(|| unsupported(src))?;
                return Ok((unescape(raw), i + 1));
            }
            i += 1;
        }
        return Err(unsupported(src));
    }

    let mut i = start;
    while i < bytes.len() && !bytes[i].is_ascii_whitespace() && bytes[i] != b']' {
        i += if bytes[i] == b'\\' { 2 } else { 1 };
    }
    let i = i.min(bytes.len());
    let raw = src.get(start..i).ok_or_else(|| unsupported(src))?;
    Ok((unescape(raw), i))
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(ch);
        }
    }
    out
}
