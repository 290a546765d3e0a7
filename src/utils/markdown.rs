//! Conversion of model Markdown into Telegram MarkdownV2.
//!
//! Headings become bold lines and list items get literal bullets or numbers;
//! text outside code entities is escaped so Telegram shows it verbatim.

use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag};

const MARKDOWN_V2_RESERVED: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!', '\\',
];

pub fn escape_markdown_v2(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + text.len() / 8);
    for ch in text.chars() {
        if MARKDOWN_V2_RESERVED.contains(&ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Inside `code` and ```pre``` entities only backtick and backslash are escaped.
fn escape_code(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch == '`' || ch == '\\' {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Plain-text form of MarkdownV2 `text`: escapes are resolved and the
/// bold, italic, strikethrough and code markers are dropped.
pub fn markdown_v2_to_plain(text: &str) -> String {
    let mut plain = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    plain.push(escaped);
                }
            }
            '*' | '_' | '~' | '`' => {}
            _ => plain.push(ch),
        }
    }
    plain
}

/// Pushes newlines until `out` ends with at least `count` of them.
fn ensure_newlines(out: &mut String, count: usize) {
    if out.is_empty() {
        return;
    }
    let present = out.chars().rev().take_while(|ch| *ch == '\n').count();
    for _ in present..count {
        out.push('\n');
    }
}

fn escape_link_target(target: &str) -> String {
    target.replace('\\', "\\\\").replace(')', "\\)")
}

pub fn markdown_to_telegram(text: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);

    let mut out = String::with_capacity(text.len() + text.len() / 4);
    let mut lists: Vec<Option<u64>> = Vec::new();
    let mut links: Vec<String> = Vec::new();
    let mut in_code_block = false;
    let mut in_heading = false;

    for event in Parser::new_ext(text, options) {
        match event {
            Event::Start(tag) => match tag {
                Tag::Heading(..) => {
                    ensure_newlines(&mut out, 2);
                    out.push('*');
                    in_heading = true;
                }
                Tag::CodeBlock(kind) => {
                    ensure_newlines(&mut out, 1);
                    out.push_str("```");
                    if let CodeBlockKind::Fenced(info) = kind {
                        let language = info.split_whitespace().next().unwrap_or_default();
                        out.push_str(&escape_code(language));
                    }
                    out.push('\n');
                    in_code_block = true;
                }
                Tag::List(start) => {
                    ensure_newlines(&mut out, 1);
                    lists.push(start);
                }
                Tag::Item => {
                    ensure_newlines(&mut out, 1);
                    out.push_str(&"  ".repeat(lists.len().saturating_sub(1)));
                    match lists.last_mut() {
                        Some(Some(number)) => {
                            out.push_str(&format!("{number}\\. "));
                            *number += 1;
                        }
                        _ => out.push_str("• "),
                    }
                }
                Tag::Emphasis if !in_heading => out.push('_'),
                Tag::Strong if !in_heading => out.push('*'),
                Tag::Strikethrough => out.push('~'),
                Tag::Link(_, target, _) | Tag::Image(_, target, _) => {
                    out.push('[');
                    links.push(target.to_string());
                }
                _ => {}
            },
            Event::End(tag) => match tag {
                Tag::Paragraph => {
                    ensure_newlines(&mut out, if lists.is_empty() { 2 } else { 1 });
                }
                Tag::Heading(..) => {
                    out.push('*');
                    in_heading = false;
                    ensure_newlines(&mut out, 2);
                }
                Tag::CodeBlock(_) => {
                    ensure_newlines(&mut out, 1);
                    out.push_str("```");
                    in_code_block = false;
                    ensure_newlines(&mut out, 2);
                }
                Tag::List(_) => {
                    lists.pop();
                    if lists.is_empty() {
                        ensure_newlines(&mut out, 2);
                    }
                }
                Tag::Item => ensure_newlines(&mut out, 1),
                Tag::Emphasis if !in_heading => out.push('_'),
                Tag::Strong if !in_heading => out.push('*'),
                Tag::Strikethrough => out.push('~'),
                Tag::Link(..) | Tag::Image(..) => {
                    if let Some(target) = links.pop() {
                        out.push_str("](");
                        out.push_str(&escape_link_target(&target));
                        out.push(')');
                    }
                }
                _ => {}
            },
            Event::Text(text) => {
                if in_code_block {
                    out.push_str(&escape_code(&text));
                } else {
                    out.push_str(&escape_markdown_v2(&text));
                }
            }
            Event::Code(code) => {
                out.push('`');
                out.push_str(&escape_code(&code));
                out.push('`');
            }
            Event::Html(html) => out.push_str(&escape_markdown_v2(&html)),
            Event::SoftBreak | Event::HardBreak => out.push('\n'),
            Event::Rule => {
                ensure_newlines(&mut out, 1);
                out.push_str("──────────");
                ensure_newlines(&mut out, 2);
            }
            Event::TaskListMarker(done) => out.push_str(if done { "☑ " } else { "☐ " }),
            Event::FootnoteReference(_) => {}
        }
    }

    let trimmed = out.trim_end_matches('\n').len();
    out.truncate(trimmed);
    out
}
