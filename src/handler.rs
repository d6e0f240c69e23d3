use anyhow::Result;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use crate::app::{App, InputMode, Screen};
use crate::tui::AppEvent;

/// Convert a character index to a byte index for UTF-8 safe string operations
fn char_to_byte_index(s: &str, char_idx: usize) -> usize {
    s.char_indices()
        .nth(char_idx)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

pub async fn handle_event(app: &mut App, event: AppEvent) -> Result<()> {
    match event {
        AppEvent::Key(key) => handle_key(app, key)?,
        AppEvent::Resize => {}
        AppEvent::Tick => {
            app.tick();
            app.poll_request().await?;
        }
    }
    Ok(())
}

fn handle_key(app: &mut App, key: KeyEvent) -> Result<()> {
    // Global keys that work in any mode
    if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
        app.should_quit = true;
        return Ok(());
    }

    match app.screen {
        Screen::Chat => handle_chat_key(app, key)?,
        Screen::Settings => handle_settings_key(app, key),
        Screen::Threads => handle_threads_key(app, key)?,
    }
    Ok(())
}

fn handle_chat_key(app: &mut App, key: KeyEvent) -> Result<()> {
    match app.input_mode {
        InputMode::Editing => handle_prompt_editing(app, key),
        InputMode::Normal => handle_chat_normal(app, key),
    }
}

fn handle_chat_normal(app: &mut App, key: KeyEvent) -> Result<()> {
    match key.code {
        KeyCode::Char('q') => app.should_quit = true,

        // Focus the prompt
        KeyCode::Char('i') | KeyCode::Char('/') => {
            app.input_mode = InputMode::Editing;
        }

        // Screens
        KeyCode::Char('s') => {
            app.screen = Screen::Settings;
        }
        KeyCode::Char('t') => {
            app.open_threads();
        }

        // New thread
        KeyCode::Char('n') => {
            app.new_thread()?;
            app.input_mode = InputMode::Editing;
        }

        // Adopt a related question from the latest reply as the next prompt
        KeyCode::Char(c @ '1'..='9') => {
            let index = (c as u8 - b'1') as usize;
            if app.adopt_related_question(index) {
                app.input_mode = InputMode::Editing;
            }
        }

        // Transcript scrolling
        KeyCode::Char('j') | KeyCode::Down => app.scroll_chat_down(),
        KeyCode::Char('k') | KeyCode::Up => app.scroll_chat_up(),
        KeyCode::Char('g') => {
            app.chat_scroll = 0;
            app.auto_scroll = false;
        }
        KeyCode::Char('G') => {
            app.auto_scroll = true;
        }

        _ => {}
    }
    Ok(())
}

fn handle_prompt_editing(app: &mut App, key: KeyEvent) -> Result<()> {
    match key.code {
        KeyCode::Esc => {
            app.input_mode = InputMode::Normal;
        }
        // Enter submits; Shift+Enter inserts a literal newline instead
        KeyCode::Enter => {
            if key.modifiers.contains(KeyModifiers::SHIFT) {
                insert_prompt_char(app, '\n');
            } else {
                app.submit_prompt();
            }
        }
        KeyCode::Backspace => {
            if app.prompt_cursor > 0 {
                app.prompt_cursor -= 1;
                let byte_pos = char_to_byte_index(&app.prompt_input, app.prompt_cursor);
                app.prompt_input.remove(byte_pos);
            }
        }
        KeyCode::Delete => {
            let char_count = app.prompt_input.chars().count();
            if app.prompt_cursor < char_count {
                let byte_pos = char_to_byte_index(&app.prompt_input, app.prompt_cursor);
                app.prompt_input.remove(byte_pos);
            }
        }
        KeyCode::Left => {
            app.prompt_cursor = app.prompt_cursor.saturating_sub(1);
        }
        KeyCode::Right => {
            let char_count = app.prompt_input.chars().count();
            app.prompt_cursor = (app.prompt_cursor + 1).min(char_count);
        }
        KeyCode::Home => {
            app.prompt_cursor = 0;
        }
        KeyCode::End => {
            app.prompt_cursor = app.prompt_input.chars().count();
        }
        KeyCode::Char(c) => {
            insert_prompt_char(app, c);
        }
        _ => {}
    }
    Ok(())
}

fn insert_prompt_char(app: &mut App, c: char) {
    let byte_pos = char_to_byte_index(&app.prompt_input, app.prompt_cursor);
    app.prompt_input.insert(byte_pos, c);
    app.prompt_cursor += 1;
}

fn handle_settings_key(app: &mut App, key: KeyEvent) {
    if app.settings_editing {
        match key.code {
            KeyCode::Esc => app.cancel_setting_edit(),
            KeyCode::Enter => app.commit_setting_edit(),
            KeyCode::Backspace => {
                if app.settings_cursor > 0 {
                    app.settings_cursor -= 1;
                    let byte_pos = char_to_byte_index(&app.settings_buffer, app.settings_cursor);
                    app.settings_buffer.remove(byte_pos);
                }
            }
            KeyCode::Delete => {
                let char_count = app.settings_buffer.chars().count();
                if app.settings_cursor < char_count {
                    let byte_pos = char_to_byte_index(&app.settings_buffer, app.settings_cursor);
                    app.settings_buffer.remove(byte_pos);
                }
            }
            KeyCode::Home => {
                app.settings_cursor = 0;
            }
            KeyCode::End => {
                app.settings_cursor = app.settings_buffer.chars().count();
            }
            KeyCode::Left => {
                app.settings_cursor = app.settings_cursor.saturating_sub(1);
            }
            KeyCode::Right => {
                let char_count = app.settings_buffer.chars().count();
                app.settings_cursor = (app.settings_cursor + 1).min(char_count);
            }
            KeyCode::Char(c) => {
                let byte_pos = char_to_byte_index(&app.settings_buffer, app.settings_cursor);
                app.settings_buffer.insert(byte_pos, c);
                app.settings_cursor += 1;
            }
            _ => {}
        }
        return;
    }

    match key.code {
        KeyCode::Esc | KeyCode::Char('q') => {
            app.screen = Screen::Chat;
            app.input_mode = InputMode::Editing;
        }
        KeyCode::Char('j') | KeyCode::Down => app.settings_nav_down(),
        KeyCode::Char('k') | KeyCode::Up => app.settings_nav_up(),
        KeyCode::Char('h') | KeyCode::Left => app.adjust_setting(-1),
        KeyCode::Char('l') | KeyCode::Right => app.adjust_setting(1),
        KeyCode::Enter | KeyCode::Char('i') => {
            if app.selected_setting().is_text() {
                app.begin_setting_edit();
            } else {
                app.adjust_setting(1);
            }
        }
        _ => {}
    }
}

fn handle_threads_key(app: &mut App, key: KeyEvent) -> Result<()> {
    match key.code {
        KeyCode::Esc | KeyCode::Char('q') => {
            app.screen = Screen::Chat;
            app.input_mode = InputMode::Editing;
        }
        KeyCode::Char('j') | KeyCode::Down => app.threads_nav_down(),
        KeyCode::Char('k') | KeyCode::Up => app.threads_nav_up(),
        KeyCode::Enter => app.select_highlighted_thread()?,
        KeyCode::Char('n') => {
            app.new_thread()?;
            app.screen = Screen::Chat;
            app.input_mode = InputMode::Editing;
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::SettingsField;
    use crate::config::Config;
    use crate::store::{MemoryStateStore, Message, ThreadStore};
    use chrono::Utc;

    fn app() -> App {
        let store = ThreadStore::load(Box::new(MemoryStateStore::default())).unwrap();
        App::new(Config::new(), store)
    }

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn reply_with_related(questions: &[&str]) -> Message {
        Message {
            id: "1".to_string(),
            user_prompt: "question".to_string(),
            reply: "answer".to_string(),
            citations: Vec::new(),
            related_questions: questions.iter().map(|q| q.to_string()).collect(),
            images: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn shift_enter_inserts_a_newline_instead_of_submitting() {
        let mut app = app();
        app.api_key = "pplx-test".to_string();
        for c in "line one".chars() {
            handle_key(&mut app, press(KeyCode::Char(c))).unwrap();
        }
        handle_key(
            &mut app,
            KeyEvent::new(KeyCode::Enter, KeyModifiers::SHIFT),
        )
        .unwrap();
        handle_key(&mut app, press(KeyCode::Char('x'))).unwrap();

        assert_eq!(app.prompt_input, "line one\nx");
        assert!(app.request_task.is_none());
    }

    #[test]
    fn prompt_editing_is_utf8_cursor_aware() {
        let mut app = app();
        for c in "héllo".chars() {
            handle_key(&mut app, press(KeyCode::Char(c))).unwrap();
        }
        handle_key(&mut app, press(KeyCode::Left)).unwrap();
        handle_key(&mut app, press(KeyCode::Left)).unwrap();
        handle_key(&mut app, press(KeyCode::Backspace)).unwrap();

        assert_eq!(app.prompt_input, "hélo");
        assert_eq!(app.prompt_cursor, 2);
    }

    #[test]
    fn number_key_adopts_a_related_question_into_the_prompt() {
        let mut app = app();
        let active = app.store.active_id().to_string();
        app.store
            .append_message(
                &active,
                reply_with_related(&["What about margins?", "When are earnings?"]),
            )
            .unwrap();
        app.input_mode = InputMode::Normal;

        handle_key(&mut app, press(KeyCode::Char('2'))).unwrap();

        assert_eq!(app.prompt_input, "When are earnings?");
        assert_eq!(app.prompt_cursor, "When are earnings?".chars().count());
        assert_eq!(app.input_mode, InputMode::Editing);
    }

    #[test]
    fn number_key_is_ignored_without_a_matching_related_question() {
        let mut app = app();
        app.input_mode = InputMode::Normal;

        handle_key(&mut app, press(KeyCode::Char('1'))).unwrap();

        assert!(app.prompt_input.is_empty());
        assert_eq!(app.input_mode, InputMode::Normal);
    }

    #[test]
    fn settings_editor_supports_home_end_and_delete() {
        let mut app = app();
        app.screen = Screen::Settings;
        app.settings_state.select(Some(
            SettingsField::all()
                .iter()
                .position(|f| *f == SettingsField::SystemPrompt)
                .unwrap(),
        ));

        handle_key(&mut app, press(KeyCode::Enter)).unwrap();
        assert!(app.settings_editing);
        handle_key(&mut app, press(KeyCode::Home)).unwrap();
        handle_key(&mut app, press(KeyCode::Delete)).unwrap();
        handle_key(&mut app, press(KeyCode::End)).unwrap();
        handle_key(&mut app, press(KeyCode::Char('!'))).unwrap();
        handle_key(&mut app, press(KeyCode::Enter)).unwrap();

        assert_eq!(app.params.system_prompt, "e precise and concise.!");
    }

    #[test]
    fn threads_screen_selects_an_existing_thread() {
        let mut app = app();
        let first = app.store.active_id().to_string();
        app.new_thread().unwrap();

        app.open_threads();
        assert_eq!(app.screen, Screen::Threads);
        // Newest first: index 1 is the original thread
        handle_key(&mut app, press(KeyCode::Char('j'))).unwrap();
        handle_key(&mut app, press(KeyCode::Enter)).unwrap();

        assert_eq!(app.store.active_id(), first);
        assert_eq!(app.screen, Screen::Chat);
    }
}
