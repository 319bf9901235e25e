//! The reader and printer (§6): `read` parses source text into `Value`
//! forms, `pr_str` is its inverse.
//!
//! Implements the compliant literal subset SPEC_FULL.md §6 names: nil,
//! bool-as-symbol, int64, float64, string, symbol, keyword, list, vector,
//! map, set. Reader macros, tagged literals and `#_`/`#!` are deliberately
//! absent — the core spec treats the reader as an external collaborator,
//! not something this crate needs to make fully general.
//!
//! `true`/`false` are ordinary symbols at the reader level (there is no
//! boolean tag in §3); `nil` alone is special-cased to `Value::Nil`.

use ember_core::collections::array_map::{GenericMap, GenericSet};
use ember_core::collections::list::List;
use ember_core::collections::vector::PersistentVector;
use ember_core::{Heap, HeapRef, Keyword, Payload, Symbol, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    UnexpectedEndOfInput,
    Malformed(String),
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadError::UnexpectedEndOfInput => write!(f, "unexpected end of input"),
            ReadError::Malformed(msg) => write!(f, "malformed form: {msg}"),
        }
    }
}

impl std::error::Error for ReadError {}

/// A single lexical token together with its source position, in the same
/// spirit as the compiler's own tokenizer: delimiters are their own
/// tokens, everything else accumulates until whitespace/a delimiter/a
/// string boundary is hit.
#[derive(Debug, Clone)]
struct Token {
    text: String,
    line: usize,
    col: usize,
}

fn tokenize(source: &str) -> Result<Vec<Token>, ReadError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut current_start = (0usize, 0usize);
    let mut line = 0usize;
    let mut col = 0usize;

    let flush = |current: &mut String, tokens: &mut Vec<Token>, start: (usize, usize)| {
        if !current.is_empty() {
            tokens.push(Token { text: std::mem::take(current), line: start.0, col: start.1 });
        }
    };

    let mut chars = source.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == ';' {
            for c in chars.by_ref() {
                if c == '\n' {
                    line += 1;
                    col = 0;
                    break;
                }
            }
            continue;
        }
        if ch == '"' {
            flush(&mut current, &mut tokens, current_start);
            let start = (line, col);
            let mut text = String::from("\"");
            col += 1;
            let mut closed = false;
            while let Some(c) = chars.next() {
                text.push(c);
                col += 1;
                if c == '\n' {
                    line += 1;
                    col = 0;
                }
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        text.push(escaped);
                        col += 1;
                    }
                    continue;
                }
                if c == '"' {
                    closed = true;
                    break;
                }
            }
            if !closed {
                return Err(ReadError::UnexpectedEndOfInput);
            }
            tokens.push(Token { text, line: start.0, col: start.1 });
            continue;
        }
        if ch.is_whitespace() || ch == ',' {
            flush(&mut current, &mut tokens, current_start);
            if ch == '\n' {
                line += 1;
                col = 0;
            } else {
                col += 1;
            }
            continue;
        }
        if "()[]{}".contains(ch) {
            flush(&mut current, &mut tokens, current_start);
            tokens.push(Token { text: ch.to_string(), line, col });
            col += 1;
            continue;
        }
        if ch == '#' && chars.peek() == Some(&'{') {
            flush(&mut current, &mut tokens, current_start);
            chars.next();
            tokens.push(Token { text: "#{".to_string(), line, col });
            col += 2;
            continue;
        }
        if current.is_empty() {
            current_start = (line, col);
        }
        current.push(ch);
        col += 1;
    }
    flush(&mut current, &mut tokens, current_start);
    Ok(tokens)
}

struct Reader {
    tokens: Vec<Token>,
    pos: usize,
}

impl Reader {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn read_form(&mut self, heap: &mut Heap, meta_type: HeapRef) -> Result<Value, ReadError> {
        let Some(tok) = self.advance() else {
            return Err(ReadError::UnexpectedEndOfInput);
        };
        match tok.text.as_str() {
            "(" => self.read_seq(heap, meta_type, ")").map(|items| {
                let list: List = items.into_iter().collect();
                heap.alloc_static(meta_type, Payload::ListVal(list)).value()
            }),
            "[" => self.read_seq(heap, meta_type, "]").map(|items| {
                let vec = PersistentVector::from_vec(items);
                heap.alloc_static(meta_type, Payload::Vector(vec)).value()
            }),
            "{" => {
                let items = self.read_seq(heap, meta_type, "}")?;
                if items.len() % 2 != 0 {
                    return Err(ReadError::Malformed("map literal needs an even number of forms".into()));
                }
                let mut m = GenericMap::empty();
                for pair in items.chunks(2) {
                    m = m.assoc(pair[0].clone(), pair[1].clone());
                }
                Ok(heap.alloc_static(meta_type, Payload::Map(m)).value())
            }
            "#{" => {
                let items = self.read_seq(heap, meta_type, "}")?;
                let mut s = GenericSet::empty();
                for item in items {
                    s = s.conj(item);
                }
                Ok(heap.alloc_static(meta_type, Payload::Set(s)).value())
            }
            ")" | "]" | "}" => Err(ReadError::Malformed(format!(
                "unexpected '{}' at line {} col {}",
                tok.text, tok.line, tok.col
            ))),
            _ => read_atom(&tok.text),
        }
    }

    fn read_seq(&mut self, heap: &mut Heap, meta_type: HeapRef, closer: &str) -> Result<Vec<Value>, ReadError> {
        let mut out = Vec::new();
        loop {
            match self.peek() {
                None => return Err(ReadError::UnexpectedEndOfInput),
                Some(t) if t.text == closer => {
                    self.advance();
                    return Ok(out);
                }
                _ => out.push(self.read_form(heap, meta_type)?),
            }
        }
    }
}

fn read_atom(text: &str) -> Result<Value, ReadError> {
    if text == "nil" {
        return Ok(Value::Nil);
    }
    if let Some(rest) = text.strip_prefix(':') {
        if rest.is_empty() {
            return Err(ReadError::Malformed("empty keyword".into()));
        }
        return Ok(Value::Keyword(intern_qualified(rest, Keyword::intern)));
    }
    if let Ok(i) = text.parse::<i64>() {
        return Ok(Value::Int(i));
    }
    if looks_like_float(text) {
        if let Ok(f) = text.parse::<f64>() {
            return Ok(Value::Float(f));
        }
    }
    if let Some(s) = text.strip_prefix('"') {
        let body = s.strip_suffix('"').ok_or_else(|| ReadError::Malformed("unterminated string".into()))?;
        return Ok(Value::str(unescape(body)?));
    }
    Ok(Value::Symbol(intern_qualified(text, Symbol::intern)))
}

fn looks_like_float(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    !digits.is_empty() && digits.chars().next().is_some_and(|c| c.is_ascii_digit()) && (text.contains('.') || text.contains('e') || text.contains('E'))
}

fn intern_qualified<T>(text: &str, intern: impl Fn(Option<&str>, &str) -> T) -> T {
    match text.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() => intern(Some(ns), name),
        _ => intern(None, text),
    }
}

fn unescape(body: &str) -> Result<String, ReadError> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => return Err(ReadError::Malformed(format!("unknown escape \\{other}"))),
            None => return Err(ReadError::UnexpectedEndOfInput),
        }
    }
    Ok(out)
}

/// Read the first form in `text`.
pub fn read(heap: &mut Heap, meta_type: HeapRef, text: &str) -> Result<Value, ReadError> {
    let tokens = tokenize(text)?;
    let mut reader = Reader { tokens, pos: 0 };
    reader.read_form(heap, meta_type)
}

/// Read every top-level form in `text`, in order.
pub fn read_all(heap: &mut Heap, meta_type: HeapRef, text: &str) -> Result<Vec<Value>, ReadError> {
    let tokens = tokenize(text)?;
    let mut reader = Reader { tokens, pos: 0 };
    let mut forms = Vec::new();
    while !reader.at_end() {
        forms.push(reader.read_form(heap, meta_type)?);
    }
    Ok(forms)
}

/// Print a value back to source text (§8: "read then print round-trips
/// atoms and collections for the compliant subset").
pub fn pr_str(heap: &Heap, v: &Value) -> String {
    match v {
        Value::Nil => "nil".to_string(),
        Value::NativeFn(id) => format!("#<native-fn {}>", id.0),
        Value::Symbol(s) => s.to_string(),
        Value::Keyword(k) => k.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => {
            if f.fract() == 0.0 && f.is_finite() {
                format!("{f:.1}")
            } else {
                f.to_string()
            }
        }
        Value::Char(c) => format!("\\{c}"),
        Value::Str(s) => format!("\"{}\"", escape(s)),
        Value::Int48(i) => i.to_string(),
        Value::Obj(r) => pr_obj(heap, *r),
    }
}

fn pr_obj(heap: &Heap, r: HeapRef) -> String {
    match &heap.get(r).payload {
        Payload::ListVal(l) => {
            let parts: Vec<String> = l.iter().map(|v| pr_str(heap, v)).collect();
            format!("({})", parts.join(" "))
        }
        Payload::Vector(vec) => {
            let parts: Vec<String> = vec.iter().map(|v| pr_str(heap, v)).collect();
            format!("[{}]", parts.join(" "))
        }
        Payload::Map(m) => {
            let parts: Vec<String> = m.seq().iter().map(|(k, v)| format!("{} {}", pr_str(heap, k), pr_str(heap, v))).collect();
            format!("{{{}}}", parts.join(" "))
        }
        Payload::Set(s) => {
            let parts: Vec<String> = s.seq().iter().map(|v| pr_str(heap, v)).collect();
            format!("#{{{}}}", parts.join(" "))
        }
        Payload::Elements(es) => {
            let parts: Vec<String> = es.iter().map(|v| pr_str(heap, v)).collect();
            format!("#<{}>", parts.join(" "))
        }
        _ => "#<object>".to_string(),
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_with_meta() -> (Heap, HeapRef) {
        let mut heap = Heap::new(64);
        let meta = heap.bootstrap_meta_type();
        (heap, meta)
    }

    #[test]
    fn reads_atoms() {
        let (mut heap, meta) = heap_with_meta();
        assert_eq!(read(&mut heap, meta, "nil").unwrap(), Value::Nil);
        assert_eq!(read(&mut heap, meta, "42").unwrap(), Value::Int(42));
        assert_eq!(read(&mut heap, meta, "-7").unwrap(), Value::Int(-7));
        assert_eq!(read(&mut heap, meta, "3.5").unwrap(), Value::Float(3.5));
        assert_eq!(read(&mut heap, meta, "\"hi\\nthere\"").unwrap(), Value::str("hi\nthere"));
        assert_eq!(read(&mut heap, meta, "foo/bar").unwrap(), Value::Symbol(Symbol::intern(Some("foo"), "bar")));
        assert_eq!(read(&mut heap, meta, ":kw").unwrap(), Value::Keyword(Keyword::unqualified("kw")));
    }

    #[test]
    fn reads_nested_collections() {
        let (mut heap, meta) = heap_with_meta();
        let v = read(&mut heap, meta, "[1 2 (3 4) {:a 1} #{5 6}]").unwrap();
        let Value::Obj(r) = v else { panic!("expected a heap object") };
        match &heap.get(r).payload {
            Payload::Vector(vec) => assert_eq!(vec.len(), 5),
            other => panic!("expected a vector payload, got {other:?}"),
        }
    }

    #[test]
    fn unclosed_form_is_unexpected_end_of_input() {
        let (mut heap, meta) = heap_with_meta();
        assert_eq!(read(&mut heap, meta, "(1 2").unwrap_err(), ReadError::UnexpectedEndOfInput);
        assert_eq!(read(&mut heap, meta, "\"abc").unwrap_err(), ReadError::UnexpectedEndOfInput);
    }

    #[test]
    fn round_trips_atoms_and_collections() {
        let (mut heap, meta) = heap_with_meta();
        for src in ["nil", "42", "-3", "\"a b\"", "foo", ":bar", "[1 2 3]", "(1 2 3)"] {
            let v = read(&mut heap, meta, src).unwrap();
            let printed = pr_str(&heap, &v);
            let v2 = read(&mut heap, meta, &printed).unwrap();
            assert_eq!(pr_str(&heap, &v2), printed, "round-trip mismatch for {src}");
        }
    }
}
