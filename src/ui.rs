use ratatui::{
    Frame,
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style, Stylize},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, Paragraph, Wrap},
};

use crate::api::ImageRef;
use crate::app::{App, InputMode, Screen, SettingsField, ToastLevel};

/// Parse a line of reply text and convert **bold** markdown to styled spans
fn parse_markdown_line(text: &str) -> Line<'static> {
    let mut spans: Vec<Span<'static>> = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '*' && chars.peek() == Some(&'*') {
            chars.next();
            let mut bold = String::new();
            let mut closed = false;
            while let Some(c) = chars.next() {
                if c == '*' && chars.peek() == Some(&'*') {
                    chars.next();
                    closed = true;
                    break;
                }
                bold.push(c);
            }
            if closed && !bold.is_empty() {
                if !current.is_empty() {
                    spans.push(Span::raw(std::mem::take(&mut current)));
                }
                spans.push(Span::styled(
                    bold,
                    Style::default().add_modifier(Modifier::BOLD),
                ));
            } else {
                current.push_str("**");
                current.push_str(&bold);
            }
        } else {
            current.push(c);
        }
    }

    if !current.is_empty() {
        spans.push(Span::raw(current));
    }
    if spans.is_empty() {
        Line::default()
    } else {
        Line::from(spans)
    }
}

pub fn render(app: &mut App, frame: &mut Frame) {
    let area = frame.area();

    let [header_area, body_area, footer_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Min(0),
        Constraint::Length(1),
    ])
    .areas(area);

    render_header(app, frame, header_area);

    match app.screen {
        Screen::Chat => render_chat_screen(app, frame, body_area),
        Screen::Settings => render_settings_screen(app, frame, body_area),
        Screen::Threads => render_threads_screen(app, frame, body_area),
    }

    render_footer(app, frame, footer_area);
    render_toast(app, frame, area);
}

fn render_header(app: &App, frame: &mut Frame, area: Rect) {
    let thread_name = app
        .store
        .active_thread()
        .map(|t| t.name.clone())
        .unwrap_or_default();

    let key_indicator = if app.api_key.trim().is_empty() {
        Span::styled(" [no API key]", Style::default().fg(Color::Red))
    } else {
        Span::styled(" [key set]", Style::default().fg(Color::DarkGray))
    };

    let title = Line::from(vec![
        Span::styled(" Sonar ", Style::default().fg(Color::Cyan).bold()),
        Span::styled(
            format!("{} · {}", app.params.model.as_str(), thread_name),
            Style::default().fg(Color::DarkGray),
        ),
        key_indicator,
        Span::raw(" "),
        Span::styled(
            format!("v{}", env!("CARGO_PKG_VERSION")),
            Style::default().fg(Color::DarkGray),
        ),
    ]);
    frame.render_widget(Paragraph::new(title), area);
}

fn render_footer(app: &App, frame: &mut Frame, area: Rect) {
    let keys = match app.screen {
        Screen::Chat => match app.input_mode {
            InputMode::Editing => " Enter send · Shift+Enter newline · Esc nav ",
            InputMode::Normal => " i type · j/k scroll · 1-9 ask related · n new · t threads · s settings · q quit ",
        },
        Screen::Settings => " j/k select · h/l adjust · Enter edit · Esc back ",
        Screen::Threads => " j/k select · Enter open · n new thread · Esc back ",
    };
    frame.render_widget(
        Paragraph::new(Line::from(Span::styled(
            keys,
            Style::default().fg(Color::DarkGray),
        ))),
        area,
    );
}

fn render_chat_screen(app: &mut App, frame: &mut Frame, area: Rect) {
    let [transcript_area, input_area] = Layout::vertical([
        Constraint::Min(3),
        Constraint::Length(5),
    ])
    .areas(area);

    render_transcript(app, frame, transcript_area);
    render_prompt_input(app, frame, input_area);
}

fn render_transcript(app: &mut App, frame: &mut Frame, area: Rect) {
    let mut lines: Vec<Line> = Vec::new();

    if let Some(thread) = app.store.active_thread() {
        for message in &thread.messages {
            lines.push(Line::from(Span::styled(
                "You:",
                Style::default().fg(Color::Blue).bold(),
            )));
            for l in message.user_prompt.lines() {
                lines.push(Line::raw(l.to_string()));
            }
            lines.push(Line::default());

            lines.push(Line::from(Span::styled(
                "Sonar:",
                Style::default().fg(Color::Green).bold(),
            )));
            for l in message.reply.lines() {
                lines.push(parse_markdown_line(l));
            }

            if !message.citations.is_empty() {
                lines.push(Line::default());
                lines.push(Line::from(Span::styled(
                    "Citations:",
                    Style::default().fg(Color::DarkGray),
                )));
                for (i, citation) in message.citations.iter().enumerate() {
                    lines.push(Line::from(Span::styled(
                        format!("  [{}] {}", i + 1, citation),
                        Style::default().fg(Color::DarkGray),
                    )));
                }
            }

            if !message.related_questions.is_empty() {
                lines.push(Line::default());
                lines.push(Line::from(Span::styled(
                    "Related:",
                    Style::default().fg(Color::DarkGray),
                )));
                for (i, question) in message.related_questions.iter().enumerate() {
                    lines.push(Line::from(Span::styled(
                        format!("  ({}) {}", i + 1, question),
                        Style::default().fg(Color::Magenta),
                    )));
                }
            }

            if !message.images.is_empty() {
                lines.push(Line::default());
                lines.push(Line::from(Span::styled(
                    "Images:",
                    Style::default().fg(Color::DarkGray),
                )));
                for image in &message.images {
                    lines.push(Line::from(Span::styled(
                        format!("  {}", describe_image(image)),
                        Style::default().fg(Color::Cyan),
                    )));
                }
            }

            lines.push(Line::default());
        }
    }

    if app.request_in_flight() {
        let dots = ".".repeat((app.animation_frame + 1) as usize);
        lines.push(Line::from(Span::styled(
            format!("Thinking{}", dots),
            Style::default().fg(Color::Yellow).italic(),
        )));
    }

    let inner_height = area.height.saturating_sub(2);
    let inner_width = area.width.saturating_sub(2).max(1);

    let total_lines = wrapped_line_count(&lines, inner_width as usize);
    let max_scroll = total_lines.saturating_sub(inner_height);
    if app.auto_scroll {
        app.chat_scroll = max_scroll;
    } else {
        app.chat_scroll = app.chat_scroll.min(max_scroll);
    }

    let block = Block::default()
        .borders(Borders::ALL)
        .title(" Conversation ")
        .border_style(Style::default().fg(Color::DarkGray));

    frame.render_widget(
        Paragraph::new(lines)
            .block(block)
            .wrap(Wrap { trim: false })
            .scroll((app.chat_scroll, 0)),
        area,
    );
}

fn wrapped_line_count(lines: &[Line], width: usize) -> u16 {
    let width = width.max(1);
    let mut total = 0u16;
    for line in lines {
        let chars: usize = line.spans.iter().map(|s| s.content.chars().count()).sum();
        // Ceiling division; an empty line still occupies one row
        let rows = chars.div_ceil(width).max(1);
        total = total.saturating_add(rows.min(u16::MAX as usize) as u16);
    }
    total
}

fn describe_image(image: &ImageRef) -> String {
    match (image.title(), image.url()) {
        (Some(title), Some(url)) => format!("{} ({})", title, url),
        (None, Some(url)) => url.to_string(),
        (Some(title), None) => title.to_string(),
        (None, None) => "(no url)".to_string(),
    }
}

fn render_prompt_input(app: &App, frame: &mut Frame, area: Rect) {
    let editing = app.input_mode == InputMode::Editing;
    let border = if editing {
        Style::default().fg(Color::Cyan)
    } else {
        Style::default().fg(Color::DarkGray)
    };
    let title = if app.request_in_flight() {
        " Message (waiting for reply) "
    } else {
        " Message "
    };

    let block = Block::default()
        .borders(Borders::ALL)
        .title(title)
        .border_style(border);

    frame.render_widget(
        Paragraph::new(app.prompt_input.as_str())
            .block(block)
            .wrap(Wrap { trim: false }),
        area,
    );

    if editing {
        // Cursor position within the (wrapped) input box
        let width = area.width.saturating_sub(2).max(1) as usize;
        let mut row = 0u16;
        let mut col = 0u16;
        for (i, c) in app.prompt_input.chars().enumerate() {
            if i == app.prompt_cursor {
                break;
            }
            if c == '\n' || col as usize + 1 >= width {
                row += 1;
                col = 0;
            } else {
                col += 1;
            }
        }
        frame.set_cursor_position((area.x + 1 + col, area.y + 1 + row));
    }
}

fn render_settings_screen(app: &mut App, frame: &mut Frame, area: Rect) {
    let items: Vec<ListItem> = SettingsField::all()
        .iter()
        .map(|field| {
            let value = setting_value(app, *field);
            ListItem::new(Line::from(vec![
                Span::styled(
                    format!("{:<26}", field.label()),
                    Style::default().fg(Color::White),
                ),
                Span::styled(value, Style::default().fg(Color::Cyan)),
            ]))
        })
        .collect();

    let list = List::new(items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(" Settings ")
                .border_style(Style::default().fg(Color::DarkGray)),
        )
        .highlight_style(
            Style::default()
                .bg(Color::DarkGray)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("> ");

    frame.render_stateful_widget(list, area, &mut app.settings_state);

    if app.settings_editing {
        render_setting_editor(app, frame, area);
    }
}

fn setting_value(app: &App, field: SettingsField) -> String {
    match field {
        SettingsField::ApiKey => {
            if app.api_key.trim().is_empty() {
                "(not set)".to_string()
            } else {
                mask_key(&app.api_key)
            }
        }
        SettingsField::Model => app.params.model.as_str().to_string(),
        SettingsField::SystemPrompt => app.params.system_prompt.clone(),
        SettingsField::Temperature => format!("{:.1}", app.params.temperature),
        SettingsField::MaxTokens => app.params.max_tokens.to_string(),
        SettingsField::TopP => format!("{:.2}", app.params.top_p),
        SettingsField::FrequencyPenalty => format!("{:.1}", app.params.frequency_penalty),
        SettingsField::PresencePenalty => format!("{:.1}", app.params.presence_penalty),
        SettingsField::SearchRecency => app.params.search_recency.as_str().to_string(),
        SettingsField::ReturnImages => checkbox(app.params.return_images),
        SettingsField::ReturnRelatedQuestions => checkbox(app.params.return_related_questions),
    }
}

fn checkbox(value: bool) -> String {
    if value { "[x]" } else { "[ ]" }.to_string()
}

fn mask_key(key: &str) -> String {
    let visible: String = key.chars().take(4).collect();
    format!("{}{}", visible, "*".repeat(key.chars().count().saturating_sub(4)))
}

fn render_setting_editor(app: &App, frame: &mut Frame, area: Rect) {
    let field = app.selected_setting();
    let popup = centered_rect(area, 70, 3);
    frame.render_widget(Clear, popup);

    let display = if field == SettingsField::ApiKey {
        mask_key(&app.settings_buffer)
    } else {
        app.settings_buffer.clone()
    };

    let block = Block::default()
        .borders(Borders::ALL)
        .title(format!(" {} (Enter save, Esc cancel) ", field.label()))
        .border_style(Style::default().fg(Color::Cyan));

    frame.render_widget(Paragraph::new(display).block(block), popup);

    let cursor_x = popup.x + 1 + app.settings_cursor.min(popup.width.saturating_sub(2) as usize) as u16;
    frame.set_cursor_position((cursor_x, popup.y + 1));
}

fn render_threads_screen(app: &mut App, frame: &mut Frame, area: Rect) {
    let items: Vec<ListItem> = app
        .store
        .threads_newest_first()
        .iter()
        .map(|thread| {
            let marker = if thread.id == app.store.active_id() {
                "* "
            } else {
                "  "
            };
            ListItem::new(Line::from(vec![
                Span::raw(marker),
                Span::styled(thread.name.clone(), Style::default().fg(Color::White)),
                Span::styled(
                    format!("  ({} messages)", thread.messages.len()),
                    Style::default().fg(Color::DarkGray),
                ),
            ]))
        })
        .collect();

    let list = List::new(items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(" Threads (newest first) ")
                .border_style(Style::default().fg(Color::DarkGray)),
        )
        .highlight_style(
            Style::default()
                .bg(Color::DarkGray)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("> ");

    frame.render_stateful_widget(list, area, &mut app.threads_state);
}

fn render_toast(app: &App, frame: &mut Frame, area: Rect) {
    let Some(toast) = app.current_toast() else {
        return;
    };

    let (color, tag) = match toast.level {
        ToastLevel::Info => (Color::Blue, "info"),
        ToastLevel::Warning => (Color::Yellow, "warning"),
        ToastLevel::Error => (Color::Red, "error"),
    };

    let width = (toast.text.chars().count() as u16 + 4)
        .min(area.width.saturating_sub(4))
        .max(20);
    let popup = Rect {
        x: area.width.saturating_sub(width + 1),
        y: area.height.saturating_sub(4),
        width,
        height: 3,
    };

    frame.render_widget(Clear, popup);
    frame.render_widget(
        Paragraph::new(toast.text.as_str())
            .wrap(Wrap { trim: true })
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(format!(" {} ", tag))
                    .border_style(Style::default().fg(color)),
            ),
        popup,
    );
}

fn centered_rect(area: Rect, percent_x: u16, height: u16) -> Rect {
    let width = area.width * percent_x / 100;
    Rect {
        x: area.x + (area.width.saturating_sub(width)) / 2,
        y: area.y + (area.height.saturating_sub(height)) / 2,
        width,
        height,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_line_count_rounds_up_without_overshooting() {
        let lines = vec![
            Line::raw("a".repeat(10)), // exactly the width: one row
            Line::raw(""),             // empty: still one row
            Line::raw("a".repeat(11)), // one past the width: two rows
        ];
        assert_eq!(wrapped_line_count(&lines, 10), 4);
    }

    #[test]
    fn wrapped_line_count_saturates_on_huge_transcripts() {
        let lines = vec![Line::raw("a".repeat(100_000))];
        assert_eq!(wrapped_line_count(&lines, 1), u16::MAX);
    }
}
