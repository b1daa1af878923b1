//! Incremental parser for the gadget call wire format.
//!
//! The model emits gadget calls inline with its prose, delimited by three
//! configurable markers:
//!
//! ```text
//! [[gadget]]Name:invocation_id:dep1,dep2
//! [[arg]]key
//! value
//! [[arg]]nested/path/0
//! <<EOF
//! multi-line value
//! EOF
//! [[/gadget]]
//! ```
//!
//! [`GadgetCallParser::feed`] accepts arbitrary fragments and emits
//! [`ParserEvent`]s in textual order: prose before a start marker is
//! emitted immediately, while the body of a call is buffered until its
//! end marker arrives. A marker split across two fragments is held back
//! until enough text arrives to disambiguate it. Parse problems never
//! drop a call; they are attached as `parse_error` and the scheduler
//! decides policy.
//!
//! A parser instance lives for exactly one iteration. Invocation-id
//! assignment draws from a shared counter so ids stay unique across
//! iterations.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

/// Marker strings delimiting gadget calls in the text stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerConfig {
    /// Opens a call; followed by the header on the same line.
    pub start: String,
    /// Introduces an argument section.
    pub arg: String,
    /// Terminates a call.
    pub end: String,
    /// Introducer for heredoc-delimited multi-line values.
    pub heredoc: String,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            start: "[[gadget]]".to_owned(),
            arg: "[[arg]]".to_owned(),
            end: "[[/gadget]]".to_owned(),
            heredoc: "<<".to_owned(),
        }
    }
}

impl MarkerConfig {
    /// Render a parsed call back to wire format.
    ///
    /// Values containing a marker are wrapped in a heredoc so the output
    /// re-parses to the same call.
    #[must_use]
    pub fn render(&self, call: &ParsedGadgetCall) -> String {
        let mut out = String::new();
        out.push_str(&self.start);
        out.push_str(&call.name);
        out.push(':');
        out.push_str(&call.invocation_id);
        if !call.dependencies.is_empty() {
            out.push(':');
            out.push_str(&call.dependencies.join(","));
        }
        out.push('\n');
        for (key, value) in &call.raw_params {
            out.push_str(&self.arg);
            out.push_str(key);
            out.push('\n');
            let needs_heredoc = value.contains(&self.start)
                || value.contains(&self.arg)
                || value.contains(&self.end);
            if needs_heredoc {
                out.push_str(&self.heredoc);
                out.push_str("WIRE_EOF\n");
                out.push_str(value);
                out.push_str("\nWIRE_EOF\n");
            } else {
                out.push_str(value);
                out.push('\n');
            }
        }
        out.push_str(&self.end);
        out.push('\n');
        out
    }
}

/// A gadget call extracted from the text stream.
#[derive(Debug, Clone)]
pub struct ParsedGadgetCall {
    /// Gadget name from the header.
    pub name: String,
    /// Caller-supplied or generated invocation id.
    pub invocation_id: String,
    /// Invocation ids this call depends on.
    pub dependencies: Vec<String>,
    /// Argument sections in textual order, raw values.
    pub raw_params: Vec<(String, String)>,
    /// Nested parameter map built from hierarchical keys.
    pub params: Value,
    /// Problems encountered while parsing; execution still proceeds.
    pub parse_error: Option<String>,
}

/// An event produced by the parser, in textual order.
#[derive(Debug, Clone)]
pub enum ParserEvent {
    /// Prose outside any gadget call.
    Text(String),
    /// A complete (or, at finalize, partial) gadget call.
    Call(ParsedGadgetCall),
}

/// Incremental gadget call parser for a single iteration.
#[derive(Debug)]
pub struct GadgetCallParser {
    markers: MarkerConfig,
    counter: Arc<AtomicU64>,
    buffer: String,
    in_call: bool,
}

impl GadgetCallParser {
    /// Create a parser drawing auto-assigned invocation ids from
    /// `counter`.
    #[must_use]
    pub fn new(markers: MarkerConfig, counter: Arc<AtomicU64>) -> Self {
        Self {
            markers,
            counter,
            buffer: String::new(),
            in_call: false,
        }
    }

    /// The marker configuration in use.
    #[must_use]
    pub const fn markers(&self) -> &MarkerConfig {
        &self.markers
    }

    /// Feed a text fragment, returning the events it completes.
    pub fn feed(&mut self, fragment: &str) -> Vec<ParserEvent> {
        self.buffer.push_str(fragment);
        let mut events = Vec::new();

        loop {
            if self.in_call {
                let Some(end) = self.buffer.find(&self.markers.end) else {
                    break;
                };
                let body: String = self.buffer[..end].to_owned();
                self.buffer.drain(..end + self.markers.end.len());
                self.in_call = false;
                events.push(ParserEvent::Call(self.parse_body(&body, None)));
            } else if let Some(start) = self.buffer.find(&self.markers.start) {
                if start > 0 {
                    events.push(ParserEvent::Text(self.buffer[..start].to_owned()));
                }
                self.buffer.drain(..start + self.markers.start.len());
                self.in_call = true;
            } else {
                // Hold back any suffix that could be the beginning of a
                // start marker split across fragments.
                let keep = partial_marker_len(&self.buffer, &self.markers.start);
                let emit = self.buffer.len() - keep;
                if emit > 0 {
                    let text: String = self.buffer.drain(..emit).collect();
                    events.push(ParserEvent::Text(text));
                }
                break;
            }
        }

        events
    }

    /// Flush trailing state at end of stream.
    ///
    /// Remaining prose becomes a final [`ParserEvent::Text`]. A call that
    /// was opened but never closed is emitted as a
    /// [`ParserEvent::Call`] with `parse_error` set rather than being
    /// dropped.
    pub fn finalize(&mut self) -> Vec<ParserEvent> {
        let mut events = Vec::new();
        if self.in_call {
            let body = std::mem::take(&mut self.buffer);
            self.in_call = false;
            events.push(ParserEvent::Call(
                self.parse_body(&body, Some("missing end marker".to_owned())),
            ));
        } else if !self.buffer.is_empty() {
            events.push(ParserEvent::Text(std::mem::take(&mut self.buffer)));
        }
        events
    }

    /// Parse a call body (everything between start and end markers).
    fn parse_body(&self, body: &str, seed_error: Option<String>) -> ParsedGadgetCall {
        let mut errors: Vec<String> = seed_error.into_iter().collect();

        // The header runs to the first newline or the first arg marker,
        // whichever comes first.
        let arg_pos = body.find(&self.markers.arg);
        let nl_pos = body.find('\n');
        let (header, rest) = match (nl_pos, arg_pos) {
            (Some(nl), Some(arg)) if nl < arg => (&body[..nl], &body[nl + 1..]),
            (_, Some(arg)) => (&body[..arg], &body[arg..]),
            (Some(nl), None) => (&body[..nl], &body[nl + 1..]),
            (None, None) => (body, ""),
        };

        let (name, invocation_id, dependencies) = self.parse_header(header, &mut errors);
        let (raw_params, params) = self.parse_args(rest, &mut errors);

        ParsedGadgetCall {
            name,
            invocation_id,
            dependencies,
            raw_params,
            params,
            parse_error: if errors.is_empty() {
                None
            } else {
                Some(errors.join("; "))
            },
        }
    }

    /// Parse `Name[:InvocationId[:dep1,dep2,...]]`.
    fn parse_header(&self, header: &str, errors: &mut Vec<String>) -> (String, String, Vec<String>) {
        let mut parts = header.trim().splitn(3, ':');
        let name = parts.next().unwrap_or("").trim().to_owned();
        if name.is_empty() {
            errors.push("empty gadget call header".to_owned());
        }

        let invocation_id = match parts.next().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_owned(),
            _ => format!("gadget-{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1),
        };

        let dependencies = parts
            .next()
            .map(|deps| {
                deps.split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        (name, invocation_id, dependencies)
    }

    /// Parse the argument sections following the header.
    ///
    /// Sections are scanned with a cursor rather than split on the arg
    /// marker so that heredoc values may contain the marker verbatim.
    fn parse_args(&self, rest: &str, errors: &mut Vec<String>) -> (Vec<(String, String)>, Value) {
        let mut raw_params = Vec::new();
        let mut params = Value::Object(serde_json::Map::new());

        let mut pos = match rest.find(&self.markers.arg) {
            Some(first) => {
                if !rest[..first].trim().is_empty() {
                    errors.push("unexpected text before first argument".to_owned());
                }
                first
            }
            None => {
                if !rest.trim().is_empty() {
                    errors.push("unexpected text before first argument".to_owned());
                }
                return (raw_params, params);
            }
        };

        while pos < rest.len() {
            pos += self.markers.arg.len();

            let key_line_end = rest[pos..].find('\n').map_or(rest.len(), |nl| pos + nl);
            let key = rest[pos..key_line_end].trim().to_owned();
            pos = (key_line_end + 1).min(rest.len());

            let (value, next_pos) = self.parse_value(rest, pos, errors);
            pos = next_pos;

            if key.is_empty() {
                errors.push("empty argument key".to_owned());
                continue;
            }

            if let Err(e) = insert_path(&mut params, &key, Value::String(value.clone())) {
                errors.push(e);
            }
            raw_params.push((key, value));
        }

        (raw_params, params)
    }

    /// Parse one argument value starting at `pos`, returning the value
    /// and the position of the next arg marker (or end of body).
    ///
    /// A heredoc value runs to its sentinel line and may contain markers;
    /// a plain value runs to the next arg marker.
    fn parse_value(&self, rest: &str, pos: usize, errors: &mut Vec<String>) -> (String, usize) {
        if rest[pos..].starts_with(&self.markers.heredoc) {
            let after = pos + self.markers.heredoc.len();
            let sentinel_end = rest[after..].find('\n').map_or(rest.len(), |nl| after + nl);
            let sentinel = rest[after..sentinel_end].trim().to_owned();
            let body_start = (sentinel_end + 1).min(rest.len());

            if sentinel.is_empty() {
                errors.push("empty heredoc sentinel".to_owned());
                let end = rest[body_start..]
                    .find(&self.markers.arg)
                    .map_or(rest.len(), |i| body_start + i);
                return (trim_value(&rest[body_start..end]).to_owned(), end);
            }

            let mut lines = Vec::new();
            let mut cursor = body_start;
            while cursor < rest.len() {
                let line_end = rest[cursor..].find('\n').map_or(rest.len(), |nl| cursor + nl);
                let line = &rest[cursor..line_end];
                let after_line = (line_end + 1).min(rest.len());
                if line.trim() == sentinel {
                    return (lines.join("\n"), after_line);
                }
                lines.push(line);
                cursor = after_line;
            }

            errors.push(format!("unterminated heredoc \"{sentinel}\""));
            (lines.join("\n"), rest.len())
        } else {
            let end = rest[pos..]
                .find(&self.markers.arg)
                .map_or(rest.len(), |i| pos + i);
            (trim_value(&rest[pos..end]).to_owned(), end)
        }
    }
}

/// Trim at most one trailing newline; the newline before the next marker
/// belongs to the framing, not the value.
fn trim_value(text: &str) -> &str {
    text.strip_suffix('\n').unwrap_or(text)
}

/// Longest proper prefix of `marker` that the buffer ends with.
fn partial_marker_len(buffer: &str, marker: &str) -> usize {
    let max = marker.len().min(buffer.len());
    for len in (1..=max).rev() {
        if len == marker.len() {
            continue;
        }
        if marker.is_char_boundary(len) && buffer.ends_with(&marker[..len]) {
            return len;
        }
    }
    0
}

/// Insert a leaf into the parameter tree at a `/`-separated path.
///
/// Non-negative integer components index into arrays (padding with nulls
/// as needed); all other components name object keys.
fn insert_path(root: &mut Value, path: &str, leaf: Value) -> Result<(), String> {
    let components: Vec<&str> = path.split('/').collect();
    let mut current = root;

    for (i, component) in components.iter().enumerate() {
        let last = i + 1 == components.len();
        match component.parse::<usize>() {
            Ok(index) => {
                let Value::Array(items) = current else {
                    return Err(format!("key path `{path}` conflicts with a non-array value"));
                };
                if items.len() <= index {
                    items.resize(index + 1, Value::Null);
                }
                if last {
                    items[index] = leaf;
                    return Ok(());
                }
                let next_is_index = components[i + 1].parse::<usize>().is_ok();
                if items[index].is_null() {
                    items[index] = empty_container(next_is_index);
                }
                current = &mut items[index];
            }
            Err(_) => {
                let Value::Object(map) = current else {
                    return Err(format!("key path `{path}` conflicts with a non-object value"));
                };
                if last {
                    map.insert((*component).to_owned(), leaf);
                    return Ok(());
                }
                let next_is_index = components[i + 1].parse::<usize>().is_ok();
                let entry = map
                    .entry((*component).to_owned())
                    .or_insert_with(|| empty_container(next_is_index));
                if entry.is_null() {
                    *entry = empty_container(next_is_index);
                }
                current = entry;
            }
        }
    }

    Ok(())
}

fn empty_container(array: bool) -> Value {
    if array {
        Value::Array(Vec::new())
    } else {
        Value::Object(serde_json::Map::new())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parser() -> GadgetCallParser {
        GadgetCallParser::new(MarkerConfig::default(), Arc::new(AtomicU64::new(0)))
    }

    fn expect_call(event: &ParserEvent) -> &ParsedGadgetCall {
        match event {
            ParserEvent::Call(call) => call,
            ParserEvent::Text(text) => panic!("expected call, got text {text:?}"),
        }
    }

    fn expect_text(event: &ParserEvent) -> &str {
        match event {
            ParserEvent::Text(text) => text,
            ParserEvent::Call(call) => panic!("expected text, got call {}", call.name),
        }
    }

    mod framing {
        use super::*;

        #[test]
        fn plain_text_passes_through() {
            let mut p = parser();
            let events = p.feed("hello world");
            assert_eq!(events.len(), 1);
            assert_eq!(expect_text(&events[0]), "hello world");
            assert!(p.finalize().is_empty());
        }

        #[test]
        fn text_before_call_is_emitted_immediately() {
            let mut p = parser();
            let events = p.feed("preamble [[gadget]]Sum:s1\n");
            assert_eq!(events.len(), 1);
            assert_eq!(expect_text(&events[0]), "preamble ");
        }

        #[test]
        fn call_body_is_buffered_until_end_marker() {
            let mut p = parser();
            assert!(p.feed("[[gadget]]Sum:s1\n[[arg]]a\n2\n").is_empty());
            let events = p.feed("[[/gadget]] tail");
            assert_eq!(events.len(), 2);
            let call = expect_call(&events[0]);
            assert_eq!(call.name, "Sum");
            assert_eq!(expect_text(&events[1]), " tail");
        }

        #[test]
        fn marker_split_across_fragments_is_buffered() {
            let mut p = parser();
            let events = p.feed("before [[gad");
            assert_eq!(events.len(), 1);
            assert_eq!(expect_text(&events[0]), "before ");
            let events = p.feed("get]]Sum:s1\n[[/gadget]]");
            assert_eq!(events.len(), 1);
            assert_eq!(expect_call(&events[0]).name, "Sum");
        }

        #[test]
        fn false_marker_prefix_is_released() {
            let mut p = parser();
            let first = p.feed("a [[ga");
            assert_eq!(expect_text(&first[0]), "a ");
            let second = p.feed("rbage");
            // "[[ga" held back, then released once it cannot be a marker.
            assert_eq!(expect_text(&second[0]), "[[garbage");
        }

        #[test]
        fn two_calls_in_one_fragment() {
            let mut p = parser();
            let events =
                p.feed("[[gadget]]A:a1\n[[/gadget]]middle[[gadget]]B:b1\n[[/gadget]]");
            assert_eq!(events.len(), 3);
            assert_eq!(expect_call(&events[0]).name, "A");
            assert_eq!(expect_text(&events[1]), "middle");
            assert_eq!(expect_call(&events[2]).name, "B");
        }

        #[test]
        fn finalize_flushes_trailing_text() {
            let mut p = parser();
            p.feed("tail [[");
            let events = p.finalize();
            assert_eq!(events.len(), 1);
            assert_eq!(expect_text(&events[0]), "tail [[");
        }

        #[test]
        fn finalize_surfaces_partial_call() {
            let mut p = parser();
            p.feed("[[gadget]]Sum:s1\n[[arg]]a\n2\n");
            let events = p.finalize();
            assert_eq!(events.len(), 1);
            let call = expect_call(&events[0]);
            assert_eq!(call.name, "Sum");
            assert!(call.parse_error.as_deref().unwrap().contains("missing end marker"));
            assert_eq!(call.raw_params, vec![("a".to_owned(), "2".to_owned())]);
        }

        #[test]
        fn custom_markers() {
            let markers = MarkerConfig {
                start: "{START}".to_owned(),
                arg: "{ARG}".to_owned(),
                end: "{END}".to_owned(),
                heredoc: "<<".to_owned(),
            };
            let mut p = GadgetCallParser::new(markers, Arc::new(AtomicU64::new(0)));
            let events = p.feed("{START}Sum:s1{ARG}a\n2{ARG}b\n3{END}");
            assert_eq!(events.len(), 1);
            let call = expect_call(&events[0]);
            assert_eq!(call.name, "Sum");
            assert_eq!(call.invocation_id, "s1");
            assert_eq!(call.params, json!({"a": "2", "b": "3"}));
            assert!(call.parse_error.is_none());
        }
    }

    mod header {
        use super::*;

        #[test]
        fn bare_name_gets_generated_id() {
            let counter = Arc::new(AtomicU64::new(0));
            let mut p = GadgetCallParser::new(MarkerConfig::default(), Arc::clone(&counter));
            let events = p.feed("[[gadget]]Fetch\n[[/gadget]][[gadget]]Fetch\n[[/gadget]]");
            assert_eq!(expect_call(&events[0]).invocation_id, "gadget-1");
            assert_eq!(expect_call(&events[1]).invocation_id, "gadget-2");
        }

        #[test]
        fn id_counter_is_shared_across_parsers() {
            let counter = Arc::new(AtomicU64::new(0));
            let mut first = GadgetCallParser::new(MarkerConfig::default(), Arc::clone(&counter));
            first.feed("[[gadget]]A\n[[/gadget]]");
            let mut second = GadgetCallParser::new(MarkerConfig::default(), Arc::clone(&counter));
            let events = second.feed("[[gadget]]B\n[[/gadget]]");
            assert_eq!(expect_call(&events[0]).invocation_id, "gadget-2");
        }

        #[test]
        fn dependencies_are_parsed() {
            let mut p = parser();
            let events = p.feed("[[gadget]]Join:d1:a1, b1 ,c1\n[[/gadget]]");
            let call = expect_call(&events[0]);
            assert_eq!(call.invocation_id, "d1");
            assert_eq!(call.dependencies, vec!["a1", "b1", "c1"]);
        }

        #[test]
        fn empty_header_is_a_parse_error() {
            let mut p = parser();
            let events = p.feed("[[gadget]]\n[[/gadget]]");
            let call = expect_call(&events[0]);
            assert!(call.parse_error.as_deref().unwrap().contains("empty gadget call header"));
        }
    }

    mod args {
        use super::*;

        #[test]
        fn multi_line_value_without_heredoc() {
            let mut p = parser();
            let events = p.feed("[[gadget]]Write:w1\n[[arg]]text\nline one\nline two\n[[/gadget]]");
            let call = expect_call(&events[0]);
            assert_eq!(call.raw_params[0].1, "line one\nline two");
        }

        #[test]
        fn heredoc_value() {
            let mut p = parser();
            let events = p.feed(
                "[[gadget]]Write:w1\n[[arg]]text\n<<EOF\nhas [[arg]]-ish stuff? no, plain\nEOF\n[[/gadget]]",
            );
            let call = expect_call(&events[0]);
            assert!(call.parse_error.is_none());
            assert_eq!(call.raw_params[0].1, "has [[arg]]-ish stuff? no, plain");
        }

        #[test]
        fn unterminated_heredoc_is_a_parse_error() {
            let mut p = parser();
            let events = p.feed("[[gadget]]Write:w1\n[[arg]]text\n<<EOF\nno terminator\n[[/gadget]]");
            let call = expect_call(&events[0]);
            assert!(call.parse_error.as_deref().unwrap().contains("unterminated heredoc"));
            assert_eq!(call.raw_params[0].1, "no terminator");
        }

        #[test]
        fn hierarchical_keys_build_nested_maps() {
            let mut p = parser();
            let events = p.feed(
                "[[gadget]]Cfg:c1\n[[arg]]server/host\nlocalhost\n[[arg]]server/ports/0\n80\n[[arg]]server/ports/1\n443\n[[/gadget]]",
            );
            let call = expect_call(&events[0]);
            assert!(call.parse_error.is_none());
            assert_eq!(
                call.params,
                json!({"server": {"host": "localhost", "ports": ["80", "443"]}})
            );
        }

        #[test]
        fn array_index_gap_pads_with_null() {
            let mut p = parser();
            let events = p.feed("[[gadget]]Cfg:c1\n[[arg]]items/2\nthird\n[[/gadget]]");
            let call = expect_call(&events[0]);
            assert_eq!(call.params, json!({"items": [null, null, "third"]}));
        }

        #[test]
        fn conflicting_path_is_a_parse_error() {
            let mut p = parser();
            let events = p.feed(
                "[[gadget]]Cfg:c1\n[[arg]]a\nscalar\n[[arg]]a/b\nnested\n[[/gadget]]",
            );
            let call = expect_call(&events[0]);
            assert!(call.parse_error.as_deref().unwrap().contains("conflicts"));
        }

        #[test]
        fn empty_key_is_a_parse_error() {
            let mut p = parser();
            let events = p.feed("[[gadget]]Cfg:c1\n[[arg]]\nvalue\n[[/gadget]]");
            let call = expect_call(&events[0]);
            assert!(call.parse_error.as_deref().unwrap().contains("empty argument key"));
        }
    }

    mod rendering {
        use super::*;

        #[test]
        fn render_roundtrips() {
            let markers = MarkerConfig::default();
            let mut p = parser();
            let events = p.feed(
                "[[gadget]]Sum:s1:a1\n[[arg]]a\n2\n[[arg]]b\n3\n[[/gadget]]",
            );
            let call = expect_call(&events[0]).clone();

            let rendered = markers.render(&call);
            let mut p2 = parser();
            let events2 = p2.feed(&rendered);
            let reparsed = expect_call(&events2[0]);
            assert_eq!(reparsed.name, call.name);
            assert_eq!(reparsed.invocation_id, call.invocation_id);
            assert_eq!(reparsed.dependencies, call.dependencies);
            assert_eq!(reparsed.raw_params, call.raw_params);
        }

        #[test]
        fn render_wraps_marker_laden_values_in_heredoc() {
            let markers = MarkerConfig::default();
            let call = ParsedGadgetCall {
                name: "Echo".to_owned(),
                invocation_id: "e1".to_owned(),
                dependencies: Vec::new(),
                raw_params: vec![("text".to_owned(), "contains [[arg]] marker".to_owned())],
                params: json!({"text": "contains [[arg]] marker"}),
                parse_error: None,
            };
            let rendered = markers.render(&call);
            let mut p = parser();
            let events = p.feed(&rendered);
            let reparsed = expect_call(&events[0]);
            assert_eq!(reparsed.raw_params[0].1, "contains [[arg]] marker");
        }
    }
}
