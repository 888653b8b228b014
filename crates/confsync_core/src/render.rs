use std::fmt::Write;

use pulldown_cmark::{CodeBlockKind, Event, HeadingLevel, Options, Parser, Tag, TagEnd};

/// Storage-format markup for one document plus the local images it
/// references. Image paths are resolved against the document's directory so
/// they can be uploaded as attachments afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub body: String,
    pub images: Vec<String>,
}

/// Render markdown text to wiki storage format.
///
/// With `hard_wraps`, single newlines inside a paragraph become line breaks
/// instead of collapsing into the surrounding text.
pub fn render_markdown(source_path: &str, text: &str, hard_wraps: bool) -> Rendered {
    let mut parser_options = Options::empty();
    parser_options.insert(Options::ENABLE_TABLES);
    parser_options.insert(Options::ENABLE_STRIKETHROUGH);
    parser_options.insert(Options::ENABLE_TASKLISTS);
    parser_options.insert(Options::ENABLE_DEFINITION_LIST);
    let parser = Parser::new_ext(text, parser_options);
    StorageRenderer::new(source_path, hard_wraps).render(parser)
}

struct StorageRenderer {
    output: String,
    images: Vec<String>,
    source_dir: Option<String>,
    hard_wraps: bool,
    in_code_block: bool,
    in_table_head: bool,
    in_image: bool,
}

impl StorageRenderer {
    fn new(source_path: &str, hard_wraps: bool) -> Self {
        let source_dir = source_path
            .rsplit_once('/')
            .map(|(dir, _)| dir.to_string())
            .filter(|dir| !dir.is_empty());
        Self {
            output: String::with_capacity(4096),
            images: Vec::new(),
            source_dir,
            hard_wraps,
            in_code_block: false,
            in_table_head: false,
            in_image: false,
        }
    }

    fn render<'a>(mut self, events: impl Iterator<Item = Event<'a>>) -> Rendered {
        for event in events {
            self.event(event);
        }
        Rendered {
            body: self.output,
            images: self.images,
        }
    }

    fn event(&mut self, event: Event<'_>) {
        // the attachment reference stands in for everything inside an image
        if self.in_image && !matches!(event, Event::End(TagEnd::Image)) {
            return;
        }
        match event {
            Event::Start(tag) => self.start_tag(tag),
            Event::End(tag) => self.end_tag(tag),
            Event::Text(text) => self.text(&text),
            Event::Code(code) => {
                let _ = write!(self.output, "<code>{}</code>", escape_storage(&code));
            }
            Event::SoftBreak => {
                if self.hard_wraps {
                    self.output.push_str("<br />");
                } else {
                    self.output.push('\n');
                }
            }
            Event::HardBreak => self.output.push_str("<br />"),
            Event::Rule => self.output.push_str("<hr />"),
            Event::TaskListMarker(checked) => {
                self.output.push_str(if checked { "[x] " } else { "[ ] " });
            }
            // no storage-format counterpart
            Event::Html(_)
            | Event::InlineHtml(_)
            | Event::FootnoteReference(_)
            | Event::InlineMath(_)
            | Event::DisplayMath(_) => {}
        }
    }

    fn start_tag(&mut self, tag: Tag<'_>) {
        match tag {
            Tag::Paragraph => self.output.push_str("<p>"),
            Tag::Heading { level, .. } => {
                let _ = write!(self.output, "<h{}>", heading_number(level));
            }
            Tag::BlockQuote(_) => {
                self.output.push_str(
                    r#"<ac:structured-macro ac:name="info" ac:schema-version="1"><ac:rich-text-body>"#,
                );
            }
            Tag::CodeBlock(kind) => {
                self.in_code_block = true;
                self.output
                    .push_str(r#"<ac:structured-macro ac:name="code" ac:schema-version="1">"#);
                if let CodeBlockKind::Fenced(info) = kind
                    && let Some(language) = info.split_whitespace().next()
                    && !language.is_empty()
                {
                    let _ = write!(
                        self.output,
                        r#"<ac:parameter ac:name="language">{}</ac:parameter>"#,
                        escape_storage(language)
                    );
                }
                self.output.push_str(r#"<ac:plain-text-body><![CDATA["#);
            }
            Tag::List(start) => {
                if start.is_some() {
                    self.output.push_str("<ol>");
                } else {
                    self.output.push_str("<ul>");
                }
            }
            Tag::Item => self.output.push_str("<li>"),
            Tag::Table(_) => self.output.push_str("<table><tbody>"),
            Tag::TableHead => {
                self.in_table_head = true;
                self.output.push_str("<tr>");
            }
            Tag::TableRow => self.output.push_str("<tr>"),
            Tag::TableCell => {
                if self.in_table_head {
                    self.output.push_str("<th>");
                } else {
                    self.output.push_str("<td>");
                }
            }
            Tag::Emphasis => self.output.push_str("<em>"),
            Tag::Strong => self.output.push_str("<strong>"),
            Tag::Strikethrough => self.output.push_str("<s>"),
            Tag::Superscript => self.output.push_str("<sup>"),
            Tag::Subscript => self.output.push_str("<sub>"),
            Tag::Link { dest_url, .. } => {
                let _ = write!(self.output, r#"<a href="{}">"#, escape_storage(&dest_url));
            }
            Tag::Image { dest_url, .. } => {
                self.in_image = true;
                if dest_url.starts_with("http://") || dest_url.starts_with("https://") {
                    let _ = write!(
                        self.output,
                        r#"<ac:image><ri:url ri:value="{}" /></ac:image>"#,
                        escape_storage(&dest_url)
                    );
                } else {
                    let filename = dest_url.rsplit('/').next().unwrap_or(&dest_url);
                    let _ = write!(
                        self.output,
                        r#"<ac:image><ri:attachment ri:filename="{}" /></ac:image>"#,
                        escape_storage(filename)
                    );
                    self.images.push(self.resolve_image(&dest_url));
                }
            }
            Tag::DefinitionList => self.output.push_str("<dl>"),
            Tag::DefinitionListTitle => self.output.push_str("<dt>"),
            Tag::DefinitionListDefinition => self.output.push_str("<dd>"),
            Tag::FootnoteDefinition(_) | Tag::HtmlBlock | Tag::MetadataBlock(_) => {}
        }
    }

    fn end_tag(&mut self, tag: TagEnd) {
        match tag {
            TagEnd::Paragraph => self.output.push_str("</p>"),
            TagEnd::Heading(level) => {
                let _ = write!(self.output, "</h{}>", heading_number(level));
            }
            TagEnd::BlockQuote(_) => {
                self.output
                    .push_str("</ac:rich-text-body></ac:structured-macro>");
            }
            TagEnd::CodeBlock => {
                self.in_code_block = false;
                self.output
                    .push_str("]]></ac:plain-text-body></ac:structured-macro>");
            }
            TagEnd::List(ordered) => {
                if ordered {
                    self.output.push_str("</ol>");
                } else {
                    self.output.push_str("</ul>");
                }
            }
            TagEnd::Item => self.output.push_str("</li>"),
            TagEnd::Table => self.output.push_str("</tbody></table>"),
            TagEnd::TableHead => {
                self.in_table_head = false;
                self.output.push_str("</tr>");
            }
            TagEnd::TableRow => self.output.push_str("</tr>"),
            TagEnd::TableCell => {
                if self.in_table_head {
                    self.output.push_str("</th>");
                } else {
                    self.output.push_str("</td>");
                }
            }
            TagEnd::Emphasis => self.output.push_str("</em>"),
            TagEnd::Strong => self.output.push_str("</strong>"),
            TagEnd::Strikethrough => self.output.push_str("</s>"),
            TagEnd::Superscript => self.output.push_str("</sup>"),
            TagEnd::Subscript => self.output.push_str("</sub>"),
            TagEnd::Link => self.output.push_str("</a>"),
            TagEnd::Image => self.in_image = false,
            TagEnd::DefinitionList => self.output.push_str("</dl>"),
            TagEnd::DefinitionListTitle => self.output.push_str("</dt>"),
            TagEnd::DefinitionListDefinition => self.output.push_str("</dd>"),
            TagEnd::FootnoteDefinition | TagEnd::HtmlBlock | TagEnd::MetadataBlock(_) => {}
        }
    }

    fn text(&mut self, text: &str) {
        if self.in_code_block {
            self.output.push_str(text);
        } else {
            self.output.push_str(&escape_storage(text));
        }
    }

    fn resolve_image(&self, dest: &str) -> String {
        match &self.source_dir {
            Some(dir) => format!("{dir}/{dest}"),
            None => dest.to_string(),
        }
    }
}

fn heading_number(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

fn escape_storage(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
