//! Minimal markdown to HTML for assistant text.
//!
//! Handles what agents actually emit in chat: fenced code, headings, bullet
//! lists and paragraphs. Everything else is escaped text.

use maud::{Markup, html};

#[derive(Debug, PartialEq, Eq)]
enum Block<'a> {
    Heading(u8, &'a str),
    Paragraph(Vec<&'a str>),
    List(Vec<&'a str>),
    Code { lang: Option<&'a str>, body: String },
}

fn parse_blocks(text: &str) -> Vec<Block<'_>> {
    let mut blocks = Vec::new();
    let mut lines = text.lines().peekable();

    while let Some(line) = lines.next() {
        let trimmed = line.trim_end();

        if let Some(info) = trimmed.trim_start().strip_prefix("```") {
            let lang = Some(info.trim()).filter(|l| !l.is_empty());
            let mut body = Vec::new();
            for code_line in lines.by_ref() {
                if code_line.trim_start().starts_with("```") {
                    break;
                }
                body.push(code_line);
            }
            // An unclosed fence runs to the end of the text
            blocks.push(Block::Code {
                lang,
                body: body.join("\n"),
            });
            continue;
        }

        if trimmed.trim().is_empty() {
            continue;
        }

        if let Some((level, title)) = heading(trimmed) {
            blocks.push(Block::Heading(level, title));
            continue;
        }

        if let Some(item) = list_item(trimmed) {
            let mut items = vec![item];
            while let Some(item) = lines.peek().copied().and_then(|l| list_item(l.trim_end())) {
                items.push(item);
                lines.next();
            }
            blocks.push(Block::List(items));
            continue;
        }

        let mut paragraph = vec![trimmed];
        while let Some(&next) = lines.peek() {
            let next = next.trim_end();
            if next.trim().is_empty()
                || next.trim_start().starts_with("```")
                || heading(next).is_some()
                || list_item(next).is_some()
            {
                break;
            }
            paragraph.push(next);
            lines.next();
        }
        blocks.push(Block::Paragraph(paragraph));
    }

    blocks
}

fn heading(line: &str) -> Option<(u8, &str)> {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if !(1..=6).contains(&hashes) {
        return None;
    }
    line[hashes..]
        .strip_prefix(' ')
        .map(|title| (hashes as u8, title.trim()))
}

fn list_item(line: &str) -> Option<&str> {
    let line = line.trim_start();
    line.strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .map(str::trim)
}

fn render_block(block: &Block<'_>) -> Markup {
    match block {
        Block::Heading(1, title) => html! { h1 { (title) } },
        Block::Heading(2, title) => html! { h2 { (title) } },
        Block::Heading(3, title) => html! { h3 { (title) } },
        Block::Heading(_, title) => html! { h4 { (title) } },
        Block::Paragraph(lines) => html! {
            p {
                @for (i, line) in lines.iter().enumerate() {
                    @if i > 0 { br; }
                    (line)
                }
            }
        },
        Block::List(items) => html! {
            ul {
                @for item in items { li { (item) } }
            }
        },
        Block::Code { lang, body } => {
            let class = lang.map(|l| format!("language-{l}"));
            html! { pre { code class=[class] { (body) } } }
        }
    }
}

/// Render agent markdown as an HTML fragment.
pub fn markdown_to_html(text: &str) -> String {
    let blocks = parse_blocks(text);
    html! {
        @for block in &blocks { (render_block(block)) }
    }
    .into_string()
}
