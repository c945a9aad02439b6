//! DOCX to HTML fragment.
//!
//! Reads the Office Open XML package directly: `word/document.xml` for the
//! body, the document relationships for hyperlink targets and
//! `word/numbering.xml` to tell bulleted from numbered lists. Conversion is
//! best-effort. Drawings, embedded objects, text boxes and field codes are
//! dropped.

use crate::error::{AppError, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use zip::ZipArchive;

const DOCUMENT_PART: &str = "word/document.xml";
const RELATIONSHIPS_PART: &str = "word/_rels/document.xml.rels";
const NUMBERING_PART: &str = "word/numbering.xml";

/// Upper bound for a single decompressed XML part
const MAX_PART_BYTES: u64 = 64 * 1024 * 1024;

/// Elements whose whole subtree carries nothing we can render
const SKIPPED_ELEMENTS: &[&[u8]] = &[
    b"drawing",
    b"pict",
    b"object",
    b"AlternateContent",
    b"txbxContent",
    b"instrText",
    b"delText",
    b"commentReference",
    b"footnoteReference",
    b"endnoteReference",
];

/// Convert a DOCX package to an HTML fragment
pub fn to_html(content: &[u8]) -> Result<String> {
    let mut archive = ZipArchive::new(Cursor::new(content))
        .map_err(|e| AppError::DecodeFailure(format!("DOCX is not a valid ZIP package: {}", e)))?;

    let document = read_part(&mut archive, DOCUMENT_PART)?.ok_or_else(|| {
        AppError::DecodeFailure(format!("DOCX package has no {}", DOCUMENT_PART))
    })?;
    let relationships = match read_part(&mut archive, RELATIONSHIPS_PART)? {
        Some(xml) => parse_relationships(&xml)?,
        None => HashMap::new(),
    };
    let numbering = match read_part(&mut archive, NUMBERING_PART)? {
        Some(xml) => parse_numbering(&xml)?,
        None => Numbering::default(),
    };

    let blocks = parse_document(&document, &relationships)?;
    Ok(render_blocks(&blocks, &numbering))
}

fn read_part<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Option<String>> {
    let file = match archive.by_name(name) {
        Ok(file) => file,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => {
            return Err(AppError::DecodeFailure(format!(
                "Failed to open {}: {}",
                name, e
            )))
        }
    };

    let mut xml = String::new();
    file.take(MAX_PART_BYTES + 1)
        .read_to_string(&mut xml)
        .map_err(|e| AppError::DecodeFailure(format!("Failed to read {}: {}", name, e)))?;
    if xml.len() as u64 > MAX_PART_BYTES {
        return Err(AppError::DecodeFailure(format!("{} is too large", name)));
    }
    Ok(Some(xml))
}

fn xml_error(part: &str, err: impl std::fmt::Display) -> AppError {
    AppError::DecodeFailure(format!("Malformed XML in {}: {}", part, err))
}

/// Value of the attribute with the given local name
fn attr(e: &BytesStart, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// `w:val` toggles: absent or anything but false/0/none means on
fn toggle(e: &BytesStart) -> bool {
    !matches!(
        attr(e, b"val").as_deref(),
        Some("false") | Some("0") | Some("none")
    )
}

fn parse_relationships(xml: &str) -> Result<HashMap<String, String>> {
    let mut reader = Reader::from_str(xml);
    let mut targets = HashMap::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"Relationship" {
                    if let (Some(id), Some(target)) = (attr(&e, b"Id"), attr(&e, b"Target")) {
                        targets.insert(id, target);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(RELATIONSHIPS_PART, e)),
            _ => {}
        }
    }

    Ok(targets)
}

/// Which (numbering id, level) pairs are ordered lists
#[derive(Debug, Default)]
struct Numbering {
    ordered: HashMap<(String, u32), bool>,
}

impl Numbering {
    fn is_ordered(&self, num_id: &str, level: u32) -> bool {
        self.ordered
            .get(&(num_id.to_string(), level))
            .copied()
            .unwrap_or(false)
    }
}

fn parse_numbering(xml: &str) -> Result<Numbering> {
    let mut reader = Reader::from_str(xml);
    // abstractNumId -> level -> ordered
    let mut abstracts: HashMap<String, HashMap<u32, bool>> = HashMap::new();
    let mut instances: Vec<(String, String)> = Vec::new();

    let mut current_abstract: Option<String> = None;
    let mut current_level: Option<u32> = None;
    let mut current_num: Option<String> = None;

    loop {
        let (e, empty) = match reader.read_event() {
            Ok(Event::Start(e)) => (e, false),
            Ok(Event::Empty(e)) => (e, true),
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"abstractNum" => current_abstract = None,
                    b"lvl" => current_level = None,
                    b"num" => current_num = None,
                    _ => {}
                }
                continue;
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(NUMBERING_PART, e)),
            _ => continue,
        };

        match e.local_name().as_ref() {
            b"abstractNum" if !empty => current_abstract = attr(&e, b"abstractNumId"),
            b"lvl" if !empty => current_level = attr(&e, b"ilvl").and_then(|v| v.parse().ok()),
            b"numFmt" => {
                if let (Some(abstract_id), Some(level)) = (&current_abstract, current_level) {
                    let ordered = attr(&e, b"val").map_or(false, |fmt| fmt != "bullet");
                    abstracts
                        .entry(abstract_id.clone())
                        .or_default()
                        .insert(level, ordered);
                }
            }
            b"num" if !empty => current_num = attr(&e, b"numId"),
            b"abstractNumId" => {
                if let (Some(num_id), Some(abstract_id)) = (&current_num, attr(&e, b"val")) {
                    instances.push((num_id.clone(), abstract_id));
                }
            }
            _ => {}
        }
    }

    let mut numbering = Numbering::default();
    for (num_id, abstract_id) in instances {
        if let Some(levels) = abstracts.get(&abstract_id) {
            for (level, ordered) in levels {
                numbering
                    .ordered
                    .insert((num_id.clone(), *level), *ordered);
            }
        }
    }
    Ok(numbering)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct RunFormat {
    bold: bool,
    italic: bool,
    underline: bool,
    strike: bool,
    superscript: bool,
    subscript: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Inline {
    Text {
        text: String,
        format: RunFormat,
        link: Option<String>,
    },
    Break,
}

#[derive(Debug, Clone, PartialEq)]
struct ListRef {
    num_id: String,
    level: u32,
}

#[derive(Debug, Default)]
struct Paragraph {
    style: Option<String>,
    list: Option<ListRef>,
    inlines: Vec<Inline>,
}

#[derive(Debug)]
enum Block {
    Paragraph(Paragraph),
    Table(Vec<Vec<Vec<Block>>>),
}

#[derive(Default)]
struct DocumentBuilder<'r> {
    relationships: Option<&'r HashMap<String, String>>,
    body: Vec<Block>,
    /// Open tables, innermost last: rows of cells of blocks
    tables: Vec<Vec<Vec<Vec<Block>>>>,
    paragraph: Option<Paragraph>,
    list_level: Option<u32>,
    list_num: Option<String>,
    run: Option<RunFormat>,
    link: Option<String>,
    in_text: bool,
    skip_depth: usize,
}

impl<'r> DocumentBuilder<'r> {
    fn new(relationships: &'r HashMap<String, String>) -> Self {
        Self {
            relationships: Some(relationships),
            ..Default::default()
        }
    }

    fn push_block(&mut self, block: Block) {
        let cell = self
            .tables
            .last_mut()
            .and_then(|rows| rows.last_mut())
            .and_then(|cells| cells.last_mut());
        match cell {
            Some(cell) => cell.push(block),
            None => self.body.push(block),
        }
    }

    fn push_text(&mut self, text: &str) {
        let (Some(paragraph), Some(format)) = (self.paragraph.as_mut(), self.run.as_ref()) else {
            return;
        };
        paragraph.inlines.push(Inline::Text {
            text: text.to_string(),
            format: format.clone(),
            link: self.link.clone(),
        });
    }

    fn start(&mut self, e: &BytesStart, empty: bool) {
        let name = e.local_name();
        let name = name.as_ref();

        if self.skip_depth > 0 {
            if !empty {
                self.skip_depth += 1;
            }
            return;
        }
        if SKIPPED_ELEMENTS.contains(&name) {
            if !empty {
                self.skip_depth = 1;
            }
            return;
        }

        match name {
            b"p" => {
                self.paragraph = Some(Paragraph::default());
                self.list_level = None;
                self.list_num = None;
            }
            b"pStyle" => {
                if let Some(paragraph) = self.paragraph.as_mut() {
                    paragraph.style = attr(e, b"val");
                }
            }
            b"ilvl" => self.list_level = attr(e, b"val").and_then(|v| v.parse().ok()),
            b"numId" => self.list_num = attr(e, b"val"),
            b"r" => self.run = Some(RunFormat::default()),
            b"b" => self.set_format(|f, on| f.bold = on, e),
            b"i" => self.set_format(|f, on| f.italic = on, e),
            b"u" => self.set_format(|f, on| f.underline = on, e),
            b"strike" | b"dstrike" => self.set_format(|f, on| f.strike = on, e),
            b"vertAlign" => {
                if let Some(format) = self.run.as_mut() {
                    let align = attr(e, b"val");
                    format.superscript = align.as_deref() == Some("superscript");
                    format.subscript = align.as_deref() == Some("subscript");
                }
            }
            b"t" => self.in_text = !empty,
            b"tab" if self.run.is_some() => self.push_text("\t"),
            b"br" | b"cr" => {
                if let Some(paragraph) = self.paragraph.as_mut() {
                    paragraph.inlines.push(Inline::Break);
                }
            }
            b"hyperlink" => {
                let external = attr(e, b"id").and_then(|id| {
                    self.relationships
                        .and_then(|rels| rels.get(&id))
                        .cloned()
                });
                self.link = external.or_else(|| attr(e, b"anchor").map(|a| format!("#{}", a)));
            }
            b"tbl" => self.tables.push(Vec::new()),
            b"tr" => {
                if let Some(rows) = self.tables.last_mut() {
                    rows.push(Vec::new());
                }
            }
            b"tc" => {
                if let Some(row) = self.tables.last_mut().and_then(|rows| rows.last_mut()) {
                    row.push(Vec::new());
                }
            }
            _ => {}
        }

        if empty {
            self.end(name);
        }
    }

    fn set_format(&mut self, apply: impl Fn(&mut RunFormat, bool), e: &BytesStart) {
        // Run properties only; paragraph-mark formatting lives outside a run
        if let Some(format) = self.run.as_mut() {
            apply(format, toggle(e));
        }
    }

    fn end(&mut self, name: &[u8]) {
        if self.skip_depth > 0 {
            self.skip_depth -= 1;
            return;
        }

        match name {
            b"p" => {
                if let Some(mut paragraph) = self.paragraph.take() {
                    if let (Some(num_id), level) = (self.list_num.take(), self.list_level.take()) {
                        if num_id != "0" {
                            paragraph.list = Some(ListRef {
                                num_id,
                                level: level.unwrap_or(0),
                            });
                        }
                    }
                    self.push_block(Block::Paragraph(paragraph));
                }
            }
            b"r" => self.run = None,
            b"t" => self.in_text = false,
            b"hyperlink" => self.link = None,
            b"tbl" => {
                if let Some(rows) = self.tables.pop() {
                    self.push_block(Block::Table(rows));
                }
            }
            _ => {}
        }
    }
}

fn parse_document(xml: &str, relationships: &HashMap<String, String>) -> Result<Vec<Block>> {
    let mut reader = Reader::from_str(xml);
    let mut builder = DocumentBuilder::new(relationships);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => builder.start(&e, false),
            Ok(Event::Empty(e)) => builder.start(&e, true),
            Ok(Event::End(e)) => builder.end(e.local_name().as_ref()),
            Ok(Event::Text(t)) => {
                if builder.in_text && builder.skip_depth == 0 {
                    let text = t.unescape().map_err(|e| xml_error(DOCUMENT_PART, e))?;
                    builder.push_text(&text);
                }
            }
            Ok(Event::CData(t)) => {
                if builder.in_text && builder.skip_depth == 0 {
                    builder.push_text(&String::from_utf8_lossy(&t));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(DOCUMENT_PART, e)),
            _ => {}
        }
    }

    Ok(builder.body)
}

fn paragraph_tag(style: Option<&str>) -> &'static str {
    let Some(style) = style else { return "p" };
    match style.to_ascii_lowercase().as_str() {
        "title" | "heading1" => "h1",
        "subtitle" | "heading2" => "h2",
        "heading3" => "h3",
        "heading4" => "h4",
        "heading5" => "h5",
        "heading6" => "h6",
        _ => "p",
    }
}

struct OpenList {
    tag: &'static str,
    item_open: bool,
}

fn close_list(out: &mut String, list: OpenList) {
    if list.item_open {
        out.push_str("</li>");
    }
    out.push_str("</");
    out.push_str(list.tag);
    out.push('>');
}

fn render_blocks(blocks: &[Block], numbering: &Numbering) -> String {
    let mut out = String::new();
    let mut lists: Vec<OpenList> = Vec::new();

    for block in blocks {
        match block {
            Block::Paragraph(paragraph) if paragraph.list.is_some() => {
                let Some(list) = &paragraph.list else { continue };
                let depth = list.level as usize + 1;
                let tag = if numbering.is_ordered(&list.num_id, list.level) {
                    "ol"
                } else {
                    "ul"
                };

                while lists.len() > depth {
                    if let Some(open) = lists.pop() {
                        close_list(&mut out, open);
                    }
                }
                if lists.len() == depth && lists.last().map(|l| l.tag) != Some(tag) {
                    if let Some(open) = lists.pop() {
                        close_list(&mut out, open);
                    }
                }
                if lists.len() == depth {
                    if let Some(open) = lists.last_mut().filter(|open| open.item_open) {
                        out.push_str("</li>");
                        open.item_open = false;
                    }
                }
                while lists.len() < depth {
                    out.push('<');
                    out.push_str(tag);
                    out.push('>');
                    lists.push(OpenList {
                        tag,
                        item_open: false,
                    });
                }

                out.push_str("<li>");
                render_inlines(&mut out, &paragraph.inlines);
                if let Some(open) = lists.last_mut() {
                    open.item_open = true;
                }
            }
            _ => {
                while let Some(open) = lists.pop() {
                    close_list(&mut out, open);
                }
                render_block(&mut out, block, numbering);
            }
        }
    }

    while let Some(open) = lists.pop() {
        close_list(&mut out, open);
    }
    out
}

fn render_block(out: &mut String, block: &Block, numbering: &Numbering) {
    match block {
        Block::Paragraph(paragraph) => {
            if paragraph.inlines.is_empty() {
                return;
            }
            let tag = paragraph_tag(paragraph.style.as_deref());
            out.push_str(&format!("<{}>", tag));
            render_inlines(out, &paragraph.inlines);
            out.push_str(&format!("</{}>\n", tag));
        }
        Block::Table(rows) => {
            out.push_str("<table>\n");
            for row in rows {
                out.push_str("<tr>");
                for cell in row {
                    out.push_str("<td>");
                    out.push_str(render_blocks(cell, numbering).trim_end());
                    out.push_str("</td>");
                }
                out.push_str("</tr>\n");
            }
            out.push_str("</table>\n");
        }
    }
}

fn render_inlines(out: &mut String, inlines: &[Inline]) {
    // Coalesce neighbouring runs that share formatting and link target
    let mut merged: Vec<Inline> = Vec::with_capacity(inlines.len());
    for inline in inlines {
        match (merged.last_mut(), inline) {
            (
                Some(Inline::Text { text, format, link }),
                Inline::Text {
                    text: next,
                    format: next_format,
                    link: next_link,
                },
            ) if format == next_format && link == next_link => text.push_str(next),
            _ => merged.push(inline.clone()),
        }
    }

    let mut open_link: Option<&str> = None;
    for inline in &merged {
        let link = match inline {
            Inline::Text { link, .. } => link.as_deref(),
            Inline::Break => open_link,
        };
        if link != open_link {
            if open_link.is_some() {
                out.push_str("</a>");
            }
            if let Some(href) = link {
                out.push_str(&format!(
                    "<a href=\"{}\">",
                    html_escape::encode_double_quoted_attribute(href)
                ));
            }
            open_link = link;
        }

        match inline {
            Inline::Break => out.push_str("<br />"),
            Inline::Text { text, format, .. } => {
                let mut tags = Vec::new();
                if format.bold {
                    tags.push("strong");
                }
                if format.italic {
                    tags.push("em");
                }
                if format.underline {
                    tags.push("u");
                }
                if format.strike {
                    tags.push("s");
                }
                if format.superscript {
                    tags.push("sup");
                } else if format.subscript {
                    tags.push("sub");
                }

                for tag in &tags {
                    out.push_str(&format!("<{}>", tag));
                }
                out.push_str(&html_escape::encode_text(text));
                for tag in tags.iter().rev() {
                    out.push_str(&format!("</{}>", tag));
                }
            }
        }
    }
    if open_link.is_some() {
        out.push_str("</a>");
    }
}
