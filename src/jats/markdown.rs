use super::{Element, XmlNode, collapse_whitespace, figure_record, math};

const MAX_HEADING_LEVEL: usize = 6;

// Known non-content tags skipped entirely during inline extraction.
const SKIP_TAGS: &[&str] = &[
    "object-id",
    "alt-text",
    "long-desc",
    "permissions",
    "copyright-statement",
    "funding-source",
    "tex-math",
    "graphic",
    "media",
];

/// Converts a JATS `<body>` to Markdown. Section nesting maps to heading
/// levels, capped at 6.
pub fn body_to_markdown(body: &Element) -> String {
    let mut blocks = Vec::new();
    render_children(body, 1, &mut blocks);
    blocks.retain(|block| !block.trim().is_empty());
    blocks.join("\n\n")
}

fn render_children(el: &Element, level: usize, blocks: &mut Vec<String>) {
    for node in &el.children {
        let XmlNode::Element(child) = node else {
            continue;
        };
        match child.local_name() {
            "sec" => render_section(child, level, blocks),
            // Section titles are emitted by render_section.
            "title" => {}
            "p" => render_paragraph(child, blocks),
            "fig" => blocks.push(figure_placeholder(child)),
            "table-wrap" => render_table_wrap(child, blocks),
            "supplementary-material" => blocks.push(supplementary_line(child)),
            "list" => render_list(child, blocks),
            "disp-formula" => {
                let formula = math::flatten_formula(child);
                if !formula.is_empty() {
                    blocks.push(formula);
                }
            }
            "disp-quote" => {
                let text = inline_text(child, &mut Vec::new());
                if !text.is_empty() {
                    blocks.push(format!("> {text}"));
                }
            }
            "boxed-text" | "statement" => render_children(child, level, blocks),
            _ => {}
        }
    }
}

fn render_section(sec: &Element, level: usize, blocks: &mut Vec<String>) {
    if let Some(title) = sec.child("title") {
        let text = inline_text(title, &mut Vec::new());
        if !text.is_empty() {
            blocks.push(format!("{} {}", heading_marker(level), text));
        }
    }
    render_children(sec, level + 1, blocks);
}

fn heading_marker(level: usize) -> String {
    "#".repeat(level.min(MAX_HEADING_LEVEL))
}

/// A paragraph's own text comes first; any table or figure embedded
/// mid-paragraph is extracted and appended after it.
fn render_paragraph(p: &Element, blocks: &mut Vec<String>) {
    let mut trailing = Vec::new();
    let text = inline_text(p, &mut trailing);
    if !text.is_empty() {
        blocks.push(text);
    }
    blocks.append(&mut trailing);
}

fn render_list(list: &Element, blocks: &mut Vec<String>) {
    let ordered = list.attr("list-type") == Some("order");
    let mut lines = Vec::new();
    for (index, item) in list.children_named("list-item").enumerate() {
        let text = inline_text(item, &mut Vec::new());
        if text.is_empty() {
            continue;
        }
        if ordered {
            lines.push(format!("{}. {}", index + 1, text));
        } else {
            lines.push(format!("- {text}"));
        }
    }
    if !lines.is_empty() {
        blocks.push(lines.join("\n"));
    }
}

/// Flattens inline content. Block elements found mid-stream (figures,
/// tables) are rendered into `trailing` instead of interrupting the text.
fn inline_text(el: &Element, trailing: &mut Vec<String>) -> String {
    let mut out = String::new();
    for node in &el.children {
        match node {
            XmlNode::Text(text) => out.push_str(text),
            XmlNode::Element(child) => render_inline(child, &mut out, trailing),
        }
    }
    collapse_whitespace(&out)
}

// Closed dispatch on element name; the default branch recurses so unknown
// wrappers still contribute their text.
fn render_inline(el: &Element, out: &mut String, trailing: &mut Vec<String>) {
    let name = el.local_name();
    if SKIP_TAGS.contains(&name) {
        return;
    }
    match name {
        "italic" | "em" => wrap_inline(el, out, trailing, "*"),
        "bold" | "strong" => wrap_inline(el, out, trailing, "**"),
        "sup" => affix_inline(el, out, trailing, "^"),
        "sub" => affix_inline(el, out, trailing, "_"),
        "inline-formula" | "disp-formula" => out.push_str(&math::flatten_formula(el)),
        "math" => out.push_str(&math::flatten_math(el)),
        "fig" => trailing.push(figure_placeholder(el)),
        "table-wrap" => render_table_wrap(el, trailing),
        "supplementary-material" => trailing.push(supplementary_line(el)),
        "xref" | "ext-link" | "uri" | "named-content" | "styled-content" => {
            out.push_str(&inline_text(el, trailing));
        }
        "break" => out.push(' '),
        _ => out.push_str(&inline_text(el, trailing)),
    }
}

fn wrap_inline(el: &Element, out: &mut String, trailing: &mut Vec<String>, marker: &str) {
    let inner = inline_text(el, trailing);
    if inner.is_empty() {
        return;
    }
    out.push_str(marker);
    out.push_str(&inner);
    out.push_str(marker);
}

fn affix_inline(el: &Element, out: &mut String, trailing: &mut Vec<String>, prefix: &str) {
    let inner = inline_text(el, trailing);
    if inner.is_empty() {
        return;
    }
    out.push_str(prefix);
    out.push_str(&inner);
}

/// `![label: caption](graphic_ref)`, degrading gracefully when a part is
/// missing.
pub fn figure_placeholder(fig: &Element) -> String {
    let record = figure_record(fig);
    let alt = match (record.label.is_empty(), record.caption.is_empty()) {
        (false, false) => format!("{}: {}", record.label, record.caption),
        (false, true) => record.label,
        (true, false) => record.caption,
        (true, true) => "Figure".to_string(),
    };
    format!("![{}]({})", alt, record.graphic_ref)
}

fn supplementary_line(el: &Element) -> String {
    let label = el
        .child("label")
        .map(|label| label.text())
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| "Supplementary material".to_string());
    let caption = el.child("caption").map(|caption| caption.text()).unwrap_or_default();
    let href = el
        .first_descendant("media")
        .and_then(|media| media.attr("href"))
        .or_else(|| el.attr("href"))
        .unwrap_or_default();
    let mut line = format!("> {label}");
    if !caption.is_empty() {
        line.push_str(&format!(": {caption}"));
    }
    if !href.is_empty() {
        line.push_str(&format!(" ({href})"));
    }
    line
}

fn render_table_wrap(wrap: &Element, blocks: &mut Vec<String>) {
    if let Some(label) = wrap.child("label") {
        let mut text = label.text();
        if let Some(caption) = wrap.child("caption") {
            let caption_text = caption.text();
            if !caption_text.is_empty() {
                text.push_str(": ");
                text.push_str(&caption_text);
            }
        }
        if !text.is_empty() {
            blocks.push(format!("**{text}**"));
        }
    }
    if let Some(table) = wrap.first_descendant("table") {
        let rendered = table_to_markdown(table);
        if !rendered.is_empty() {
            blocks.push(rendered);
        }
    }
}

/// Pipe-delimited Markdown. Header comes from `<thead>` when present,
/// otherwise the first body row is promoted. Short rows are right-padded and
/// literal pipes escaped.
pub fn table_to_markdown(table: &Element) -> String {
    let header_rows: Vec<Vec<String>> = table
        .child("thead")
        .map(|thead| collect_rows(thead))
        .unwrap_or_default();
    let mut body_rows: Vec<Vec<String>> = Vec::new();
    for tbody in table.children_named("tbody") {
        body_rows.extend(collect_rows(tbody));
    }
    // Rows placed directly under <table>.
    body_rows.extend(collect_rows(table));

    let (header, body) = match header_rows.into_iter().next() {
        Some(header) => (header, body_rows),
        None => {
            if body_rows.is_empty() {
                return String::new();
            }
            let mut rest = body_rows;
            let header = rest.remove(0);
            (header, rest)
        }
    };

    let width = std::iter::once(header.len())
        .chain(body.iter().map(|row| row.len()))
        .max()
        .unwrap_or(0);
    if width == 0 {
        return String::new();
    }

    let mut lines = Vec::with_capacity(body.len() + 2);
    lines.push(format_row(&header, width));
    lines.push(format!("|{}", " --- |".repeat(width)));
    for row in &body {
        lines.push(format_row(row, width));
    }
    lines.join("\n")
}

fn collect_rows(parent: &Element) -> Vec<Vec<String>> {
    parent
        .children_named("tr")
        .map(|tr| {
            tr.elements()
                .filter(|cell| matches!(cell.local_name(), "td" | "th"))
                .map(|cell| inline_text(cell, &mut Vec::new()).replace('|', "\\|"))
                .collect()
        })
        .collect()
}

fn format_row(cells: &[String], width: usize) -> String {
    let mut line = String::from("|");
    for index in 0..width {
        let cell = cells.get(index).map(String::as_str).unwrap_or("");
        line.push(' ');
        line.push_str(cell);
        line.push_str(" |");
    }
    line
}
