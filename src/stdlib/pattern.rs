//! A compact Lua pattern engine: not a backtracking regex engine, just the
//! classic character-class/anchor/capture/balanced-match/quantifier set
//! Lua patterns define, matched with the same recursive backtrack-on-failure
//! algorithm real Lua's `lstrlib.c` uses.
//!
//! Ground: the overall `Pattern`/recursive-match shape of
//! `lua_pattern/matcher.rs` in the teacher (Char/Dot/Class/Set/Repeat/
//! Capture/Anchor/Balanced variants, greedy-then-backtrack expansion for
//! `*`/`+`, try-zero-then-grow for the lazy `-` quantifier); the parser
//! that turns a pattern string into this instruction list doesn't exist in
//! the retrieved reference, so it's written fresh in the same spirit.
//!
//! Not supported: `%f[set]` frontier patterns and `%1`-style in-pattern
//! back-references — neither is exercised by the standard library
//! functions this engine backs (`find`/`match`/`gmatch`/`gsub`), and the
//! spec's Non-goals already rule out "regex-grade" matching.

#[derive(Clone, Copy)]
enum SetItem {
    Char(char),
    Range(char, char),
    Class(char),
}

#[derive(Clone)]
enum Matcher {
    Literal(char),
    Any,
    Class(char),
    Set(Vec<SetItem>, bool),
}

#[derive(Clone, Copy)]
enum Quant {
    One,
    Star,
    Plus,
    Minus,
    Opt,
}

#[derive(Clone)]
enum PatItem {
    Item(Matcher, Quant),
    CapStart,
    CapEnd,
    PosCap,
    Balanced(char, char),
    AnchorEnd,
}

pub struct Pattern {
    anchored: bool,
    items: Vec<PatItem>,
}

impl Pattern {
    /// Whether this pattern starts with `^`: `find` only tries matching at
    /// the exact offset it's given instead of scanning forward, and
    /// `gsub`'s caller-side loop stops after one iteration regardless of
    /// whether that one attempt matched (mirrors real `lstrlib.c`'s
    /// `if (anchor) break;`).
    pub fn is_anchored(&self) -> bool {
        self.anchored
    }
}

pub fn parse(pat: &str) -> Result<Pattern, String> {
    let chars: Vec<char> = pat.chars().collect();
    let mut i = 0;
    let anchored = chars.first() == Some(&'^');
    if anchored {
        i = 1;
    }
    let mut items = Vec::new();
    while i < chars.len() {
        match chars[i] {
            '(' => {
                if chars.get(i + 1) == Some(&')') {
                    items.push(PatItem::PosCap);
                    i += 2;
                } else {
                    items.push(PatItem::CapStart);
                    i += 1;
                }
            }
            ')' => {
                items.push(PatItem::CapEnd);
                i += 1;
            }
            '$' if i == chars.len() - 1 => {
                items.push(PatItem::AnchorEnd);
                i += 1;
            }
            '%' if chars.get(i + 1) == Some(&'b') => {
                let open = *chars.get(i + 2).ok_or("malformed pattern (missing arguments to '%b')")?;
                let close = *chars.get(i + 3).ok_or("malformed pattern (missing arguments to '%b')")?;
                items.push(PatItem::Balanced(open, close));
                i += 4;
            }
            '[' => {
                let (matcher, next) = parse_set(&chars, i)?;
                let quant = parse_quant(&chars, next);
                items.push(PatItem::Item(matcher, quant));
                i = advance_past_quant(&chars, next);
            }
            _ => {
                let (matcher, next) = parse_single(&chars, i)?;
                let quant = parse_quant(&chars, next);
                items.push(PatItem::Item(matcher, quant));
                i = advance_past_quant(&chars, next);
            }
        }
    }
    Ok(Pattern { anchored, items })
}

fn parse_quant(chars: &[char], at: usize) -> Quant {
    match chars.get(at) {
        Some('*') => Quant::Star,
        Some('+') => Quant::Plus,
        Some('-') => Quant::Minus,
        Some('?') => Quant::Opt,
        _ => Quant::One,
    }
}

fn advance_past_quant(chars: &[char], at: usize) -> usize {
    if matches!(chars.get(at), Some('*' | '+' | '-' | '?')) {
        at + 1
    } else {
        at
    }
}

/// Parses one non-`[...]`, non-capture pattern element starting at `i`,
/// returning the matcher and the index just past it (before any quantifier).
fn parse_single(chars: &[char], i: usize) -> Result<(Matcher, usize), String> {
    match chars[i] {
        '.' => Ok((Matcher::Any, i + 1)),
        '%' => {
            let c = *chars.get(i + 1).ok_or("malformed pattern (ends with '%')")?;
            if c.is_alphabetic() {
                Ok((Matcher::Class(c), i + 2))
            } else {
                Ok((Matcher::Literal(c), i + 2))
            }
        }
        c => Ok((Matcher::Literal(c), i + 1)),
    }
}

fn parse_set(chars: &[char], i: usize) -> Result<(Matcher, usize), String> {
    let mut j = i + 1;
    let negated = chars.get(j) == Some(&'^');
    if negated {
        j += 1;
    }
    let mut items = Vec::new();
    let mut first = true;
    loop {
        match chars.get(j) {
            None => return Err("malformed pattern (missing ']')".to_string()),
            Some(']') if !first => {
                j += 1;
                break;
            }
            Some('%') => {
                let c = *chars.get(j + 1).ok_or("malformed pattern (ends with '%')")?;
                if c.is_alphabetic() {
                    items.push(SetItem::Class(c));
                } else {
                    items.push(SetItem::Char(c));
                }
                j += 2;
            }
            Some(&c) => {
                if chars.get(j + 1) == Some(&'-') && chars.get(j + 2).is_some_and(|&n| n != ']') {
                    let hi = chars[j + 2];
                    items.push(SetItem::Range(c, hi));
                    j += 3;
                } else {
                    items.push(SetItem::Char(c));
                    j += 1;
                }
            }
        }
        first = false;
    }
    Ok((Matcher::Set(items, negated), j))
}

fn class_matches(c: char, cl: char) -> bool {
    let res = match cl.to_ascii_lowercase() {
        'a' => c.is_alphabetic(),
        'd' => c.is_ascii_digit(),
        'l' => c.is_lowercase(),
        'u' => c.is_uppercase(),
        's' => c.is_whitespace(),
        'w' => c.is_alphanumeric(),
        'c' => c.is_control(),
        'p' => c.is_ascii_punctuation(),
        'x' => c.is_ascii_hexdigit(),
        'g' => c.is_ascii_graphic(),
        _ => return c == cl,
    };
    if cl.is_ascii_uppercase() {
        !res
    } else {
        res
    }
}

fn single_match(c: char, m: &Matcher) -> bool {
    match m {
        Matcher::Literal(lc) => c == *lc,
        Matcher::Any => true,
        Matcher::Class(cl) => class_matches(c, *cl),
        Matcher::Set(items, negated) => {
            let found = items.iter().any(|it| match it {
                SetItem::Char(ch) => c == *ch,
                SetItem::Range(a, b) => c >= *a && c <= *b,
                SetItem::Class(cl) => class_matches(c, *cl),
            });
            found != *negated
        }
    }
}

/// One capture's extent: `end == None` while still open, or the sentinel
/// position-capture marker (records the 0-based position, not a range).
enum Cap {
    Range(usize, Option<usize>),
    Position(usize),
}

fn do_match(s: &[char], si: usize, p: &[PatItem], pi: usize, caps: &mut Vec<Cap>) -> Option<usize> {
    if pi >= p.len() {
        return Some(si);
    }
    match &p[pi] {
        PatItem::AnchorEnd => {
            if si == s.len() {
                do_match(s, si, p, pi + 1, caps)
            } else {
                None
            }
        }
        PatItem::CapStart => {
            caps.push(Cap::Range(si, None));
            let r = do_match(s, si, p, pi + 1, caps);
            if r.is_none() {
                caps.pop();
            }
            r
        }
        PatItem::CapEnd => {
            let idx = caps.iter().rposition(|c| matches!(c, Cap::Range(_, None)))?;
            if let Cap::Range(_, end) = &mut caps[idx] {
                *end = Some(si);
            }
            let r = do_match(s, si, p, pi + 1, caps);
            if r.is_none() {
                if let Cap::Range(_, end) = &mut caps[idx] {
                    *end = None;
                }
            }
            r
        }
        PatItem::PosCap => {
            caps.push(Cap::Position(si));
            let r = do_match(s, si, p, pi + 1, caps);
            if r.is_none() {
                caps.pop();
            }
            r
        }
        PatItem::Balanced(open, close) => {
            if si >= s.len() || s[si] != *open {
                return None;
            }
            let mut depth = 1;
            let mut cur = si + 1;
            while cur < s.len() {
                if s[cur] == *close {
                    depth -= 1;
                    if depth == 0 {
                        return do_match(s, cur + 1, p, pi + 1, caps);
                    }
                } else if s[cur] == *open {
                    depth += 1;
                }
                cur += 1;
            }
            None
        }
        PatItem::Item(m, quant) => match quant {
            Quant::One => {
                if si < s.len() && single_match(s[si], m) {
                    do_match(s, si + 1, p, pi + 1, caps)
                } else {
                    None
                }
            }
            Quant::Opt => {
                if si < s.len() && single_match(s[si], m) {
                    if let Some(r) = do_match(s, si + 1, p, pi + 1, caps) {
                        return Some(r);
                    }
                }
                do_match(s, si, p, pi + 1, caps)
            }
            Quant::Star => max_expand(s, si, p, pi, caps, m, 0),
            Quant::Plus => max_expand(s, si, p, pi, caps, m, 1),
            Quant::Minus => min_expand(s, si, p, pi, caps, m),
        },
    }
}

/// Greedy `*`/`+`: count the longest run of `m`, then backtrack one
/// character at a time until the rest of the pattern also matches.
fn max_expand(s: &[char], si: usize, p: &[PatItem], pi: usize, caps: &mut Vec<Cap>, m: &Matcher, min: usize) -> Option<usize> {
    let mut count = 0;
    while si + count < s.len() && single_match(s[si + count], m) {
        count += 1;
    }
    while count + 1 > min {
        if let Some(r) = do_match(s, si + count, p, pi + 1, caps) {
            return Some(r);
        }
        if count == 0 {
            break;
        }
        count -= 1;
    }
    if min == 0 {
        do_match(s, si, p, pi + 1, caps)
    } else {
        None
    }
}

/// Lazy `-`: try the rest of the pattern after zero repeats first, only
/// consuming another `m`-matching character when that fails.
fn min_expand(s: &[char], mut si: usize, p: &[PatItem], pi: usize, caps: &mut Vec<Cap>, m: &Matcher) -> Option<usize> {
    loop {
        if let Some(r) = do_match(s, si, p, pi + 1, caps) {
            return Some(r);
        }
        if si < s.len() && single_match(s[si], m) {
            si += 1;
        } else {
            return None;
        }
    }
}

/// One successful match: overall `[start, end)` plus each explicit capture
/// (substring, or 1-based position for a `()` position capture).
pub enum CaptureValue {
    Str(String),
    Position(i64),
}

pub struct MatchResult {
    pub start: usize,
    pub end: usize,
    pub captures: Vec<CaptureValue>,
}

fn resolve_captures(s: &[char], caps: &[Cap]) -> Vec<CaptureValue> {
    caps.iter()
        .map(|c| match c {
            Cap::Range(start, end) => {
                let end = end.unwrap_or(*start);
                CaptureValue::Str(s[*start..end].iter().collect())
            }
            Cap::Position(p) => CaptureValue::Position(*p as i64 + 1),
        })
        .collect()
}

/// Searches `text` (as chars) for `pattern` starting at char index `init`.
pub fn find(text: &[char], pattern: &Pattern, init: usize) -> Option<MatchResult> {
    let mut start = init.min(text.len());
    loop {
        let mut caps = Vec::new();
        if let Some(end) = do_match(text, start, &pattern.items, 0, &mut caps) {
            return Some(MatchResult { start, end, captures: resolve_captures(text, &caps) });
        }
        if pattern.anchored || start >= text.len() {
            return None;
        }
        start += 1;
    }
}
