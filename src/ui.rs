use std::collections::HashMap;
use std::io::{self, Stdout};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Padding, Paragraph, Wrap};
use ratatui::{Frame, Terminal};
use textwrap::{wrap, Options as WrapOptions};
use tracing::debug;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::data::FeedFilters;
use crate::engagement::EngagementView;
use crate::feed::{
    FeedView, MediaElementFactory, Notice, NoticeKind, Services, ThreadView, ViewOptions,
};
use crate::model::{CommentNode, MediaAttachment, Post, Vote};
use crate::playback::{
    format_timestamp, FullscreenSupport, MediaPlaybackController, PlaybackStatus,
};
use crate::virtualizer::{Align, VirtualWindow};

/// Pixels per terminal line. Row heights handed to the views are line counts scaled by
/// this, so the estimator defaults stay meaningful.
pub const LINE_HEIGHT: f64 = 20.0;

const COLOR_BG: Color = Color::Rgb(30, 30, 46);
const COLOR_PANEL_BG: Color = Color::Rgb(24, 24, 36);
const COLOR_PANEL_FOCUSED_BG: Color = Color::Rgb(49, 50, 68);
const COLOR_PANEL_SELECTED_BG: Color = Color::Rgb(69, 71, 90);
const COLOR_BORDER_IDLE: Color = Color::Rgb(49, 50, 68);
const COLOR_BORDER_FOCUSED: Color = Color::Rgb(137, 180, 250);
const COLOR_TEXT_PRIMARY: Color = Color::Rgb(205, 214, 244);
const COLOR_TEXT_SECONDARY: Color = Color::Rgb(166, 173, 200);
const COLOR_ACCENT: Color = Color::Rgb(137, 180, 250);
const COLOR_SUCCESS: Color = Color::Rgb(166, 227, 161);
const COLOR_ERROR: Color = Color::Rgb(243, 139, 168);
const COLOR_PENDING: Color = Color::Rgb(249, 226, 175);

const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const BODY_PREVIEW_LINES: usize = 3;
const PROGRESS_WIDTH: usize = 24;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Pane {
    Posts,
    Comments,
}

impl Pane {
    fn title(self) -> &'static str {
        match self {
            Pane::Posts => "Posts",
            Pane::Comments => "Comments",
        }
    }
}

struct Spinner {
    index: usize,
    last_tick: Instant,
}

impl Spinner {
    fn new() -> Self {
        Self {
            index: 0,
            last_tick: Instant::now(),
        }
    }

    fn frame(&self) -> &'static str {
        SPINNER_FRAMES[self.index % SPINNER_FRAMES.len()]
    }

    fn advance(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_tick) >= Duration::from_millis(120) {
            self.index = (self.index + 1) % SPINNER_FRAMES.len();
            self.last_tick = now;
            true
        } else {
            false
        }
    }

    fn reset(&mut self) {
        self.index = 0;
        self.last_tick = Instant::now();
    }
}

/// Draft for a new comment; `parent_id` is set when replying.
struct Composer {
    parent_id: Option<String>,
    buffer: String,
}

pub struct Options {
    pub services: Services,
    pub view: ViewOptions,
    pub filters: FeedFilters,
    pub elements: Box<dyn MediaElementFactory>,
    pub status_message: String,
}

pub struct Model {
    status_message: String,
    status_is_error: bool,
    services: Services,
    view_options: ViewOptions,
    feed: FeedView,
    thread: Option<ThreadView>,
    focused_pane: Pane,
    selected_post: usize,
    selected_comment: usize,
    composer: Option<Composer>,
    spinner: Spinner,
    post_view_height: f64,
    comment_view_height: f64,
    needs_redraw: bool,
}

impl Model {
    pub fn new(opts: Options) -> Self {
        let Options {
            services,
            view,
            filters,
            elements,
            status_message,
        } = opts;
        let mut feed = FeedView::new(services.clone(), view, elements).with_filters(filters);
        feed.load_more();
        Self {
            status_message,
            status_is_error: false,
            services,
            view_options: view,
            feed,
            thread: None,
            focused_pane: Pane::Posts,
            selected_post: 0,
            selected_comment: 0,
            composer: None,
            spinner: Spinner::new(),
            post_view_height: 0.0,
            comment_view_height: 0.0,
            needs_redraw: true,
        }
    }

    pub fn run(&mut self) -> Result<()> {
        let mut stdout = io::stdout();
        enable_raw_mode()?;
        stdout.execute(EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;
        terminal.clear()?;

        let result = self.event_loop(&mut terminal);

        self.shutdown();
        disable_raw_mode()?;
        terminal.backend_mut().execute(LeaveAlternateScreen)?;
        terminal.show_cursor()?;

        result
    }

    fn event_loop(&mut self, terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
        let mut last_tick = Instant::now();
        let tick_rate = Duration::from_millis(120);

        loop {
            if self.poll_async() {
                self.mark_dirty();
            }

            if self.needs_redraw {
                terminal.draw(|frame| self.draw(frame))?;
                self.needs_redraw = false;
            }

            let timeout = tick_rate
                .checked_sub(last_tick.elapsed())
                .unwrap_or_else(|| Duration::from_millis(16));

            if event::poll(timeout)? {
                match event::read()? {
                    Event::Key(key) if key.kind == KeyEventKind::Press => {
                        if key.modifiers.contains(KeyModifiers::CONTROL)
                            && key.code == KeyCode::Char('c')
                        {
                            break;
                        }
                        match self.handle_key(key.code) {
                            Ok(true) => break,
                            Ok(false) => {}
                            Err(err) => {
                                self.set_error(format!("Error: {err}"));
                            }
                        }
                    }
                    Event::Resize(_, _) => self.mark_dirty(),
                    _ => {}
                }
            }

            if last_tick.elapsed() >= tick_rate {
                last_tick = Instant::now();
                let mut ticked = self.feed.tick(last_tick);
                if self.is_loading() {
                    ticked |= self.spinner.advance();
                } else {
                    self.spinner.reset();
                }
                if ticked {
                    self.mark_dirty();
                }
            }
        }

        Ok(())
    }

    fn mark_dirty(&mut self) {
        self.needs_redraw = true;
    }

    fn set_status(&mut self, message: impl Into<String>) {
        self.status_message = message.into();
        self.status_is_error = false;
        self.mark_dirty();
    }

    fn set_error(&mut self, message: impl Into<String>) {
        self.status_message = message.into();
        self.status_is_error = true;
        self.mark_dirty();
    }

    fn is_loading(&self) -> bool {
        self.feed.is_fetching()
            || self
                .thread
                .as_ref()
                .map(ThreadView::is_fetching)
                .unwrap_or(false)
    }

    fn poll_async(&mut self) -> bool {
        let mut changed = self.feed.poll_async();
        let mut notices = self.feed.take_notices();
        if let Some(thread) = self.thread.as_mut() {
            changed |= thread.poll_async();
            notices.extend(thread.take_notices());
        }
        if let Some(notice) = notices.pop() {
            self.show_notice(notice);
            changed = true;
        }
        self.clamp_selection();
        changed
    }

    fn show_notice(&mut self, notice: Notice) {
        debug!(kind = ?notice.kind, "notice shown");
        let hint = match notice.kind {
            NoticeKind::FetchFailed => " (r to retry)",
            _ => "",
        };
        self.set_error(format!("{}{}", notice.message, hint));
    }

    fn clamp_selection(&mut self) {
        let posts = self.feed.posts().len();
        if posts > 0 && self.selected_post >= posts {
            self.selected_post = posts - 1;
        }
        if let Some(thread) = &self.thread {
            let comments = thread.comments().len();
            if comments > 0 && self.selected_comment >= comments {
                self.selected_comment = comments - 1;
            }
        }
    }

    fn selected_post(&self) -> Option<&Post> {
        self.feed.posts().get(self.selected_post)
    }

    fn selected_post_id(&self) -> Option<String> {
        self.selected_post().map(|post| post.id.clone())
    }

    fn selected_comment_id(&self) -> Option<String> {
        self.thread
            .as_ref()
            .and_then(|thread| thread.comments().get(self.selected_comment))
            .map(|comment| comment.id.clone())
    }

    fn shutdown(&mut self) {
        if let Some(mut thread) = self.thread.take() {
            thread.unmount();
        }
        self.feed.unmount();
    }

    fn handle_key(&mut self, code: KeyCode) -> Result<bool> {
        if self.composer.is_some() {
            self.handle_composer_key(code);
            return Ok(false);
        }

        let now = Instant::now();
        match code {
            KeyCode::Char('q') => return Ok(true),
            KeyCode::Tab => {
                if self.thread.is_some() {
                    self.focused_pane = match self.focused_pane {
                        Pane::Posts => Pane::Comments,
                        Pane::Comments => Pane::Posts,
                    };
                }
            }
            KeyCode::Esc => {
                if self.focused_pane == Pane::Comments {
                    self.close_thread();
                }
            }
            KeyCode::Char('j') | KeyCode::Down => self.move_selection(1),
            KeyCode::Char('k') | KeyCode::Up => self.move_selection(-1),
            KeyCode::PageDown => self.page(1.0),
            KeyCode::PageUp => self.page(-1.0),
            KeyCode::Char('u') => self.vote(Vote::Up),
            KeyCode::Char('d') => self.vote(Vote::Down),
            KeyCode::Char('b') => self.bookmark(),
            KeyCode::Char('c') => self.open_thread(),
            KeyCode::Enter => match self.focused_pane {
                Pane::Posts => self.open_thread(),
                Pane::Comments => self.toggle_replies(),
            },
            KeyCode::Char('n') => {
                if self.thread.is_some() {
                    self.composer = Some(Composer {
                        parent_id: None,
                        buffer: String::new(),
                    });
                }
            }
            KeyCode::Char('R') => {
                if self.focused_pane == Pane::Comments {
                    if let Some(parent_id) = self.selected_comment_id() {
                        self.composer = Some(Composer {
                            parent_id: Some(parent_id),
                            buffer: String::new(),
                        });
                    }
                }
            }
            KeyCode::Char('x') => self.remove_selected_comment(),
            KeyCode::Char('E') => self.set_all_replies(true),
            KeyCode::Char('C') => self.set_all_replies(false),
            KeyCode::Char('p') => self.play_selected(now),
            KeyCode::Char(' ') => {
                if let Some(player) = self.feed.active_player_mut() {
                    player.tap(now)?;
                }
            }
            KeyCode::Left => self.with_active_player(|player| {
                player.skip_backward(now);
            }),
            KeyCode::Right => self.with_active_player(|player| {
                player.skip_forward(now);
            }),
            KeyCode::Char('m') => self.with_active_player(|player| {
                player.toggle_mute(now);
            }),
            KeyCode::Char('f') => {
                let support = self
                    .feed
                    .active_player_mut()
                    .map(|player| player.toggle_fullscreen(now));
                if let Some(FullscreenSupport::Unsupported) = support {
                    self.set_error("Fullscreen is not supported by this player");
                }
            }
            KeyCode::Char('r') => self.retry(),
            KeyCode::Char('s') => {
                let mut filters = self.feed.filters().clone();
                filters.sort = filters.sort.next();
                self.apply_filters(filters);
            }
            KeyCode::Char('B') => {
                let mut filters = self.feed.filters().clone();
                filters.bookmarked_only = !filters.bookmarked_only;
                self.apply_filters(filters);
            }
            _ => return Ok(false),
        }
        self.mark_dirty();
        Ok(false)
    }

    fn handle_composer_key(&mut self, code: KeyCode) {
        let Some(composer) = self.composer.as_mut() else {
            return;
        };
        match code {
            KeyCode::Esc => {
                self.composer = None;
                self.set_status("Comment discarded");
            }
            KeyCode::Enter => {
                let content = composer.buffer.trim().to_string();
                let parent_id = composer.parent_id.clone();
                self.composer = None;
                if content.is_empty() {
                    self.set_status("Empty comment not sent");
                    return;
                }
                let sent = self
                    .thread
                    .as_mut()
                    .map(|thread| thread.submit_comment(&content, parent_id.as_deref()))
                    .unwrap_or(false);
                if sent {
                    self.set_status("Sending comment…");
                }
            }
            KeyCode::Backspace => {
                composer.buffer.pop();
            }
            KeyCode::Char(ch) => composer.buffer.push(ch),
            _ => {}
        }
        self.mark_dirty();
    }

    fn with_active_player<F>(&mut self, apply: F)
    where
        F: FnOnce(&mut MediaPlaybackController),
    {
        match self.feed.active_player_mut() {
            Some(player) => apply(player),
            None => self.set_status("Nothing is playing. Press p on a post with media."),
        }
    }

    fn move_selection(&mut self, delta: isize) {
        match self.focused_pane {
            Pane::Posts => {
                let len = self.feed.posts().len();
                if len == 0 {
                    return;
                }
                self.selected_post = step(self.selected_post, delta, len);
                if let Some(id) = self.selected_post_id() {
                    let index = self.selected_post;
                    let align = reveal_align(
                        self.feed.virtualizer().start_of(index),
                        self.feed.virtualizer().size(index),
                        self.feed.scroll_offset(),
                        self.post_view_height,
                    );
                    if let Some(align) = align {
                        self.feed.scroll_to_post(&id, align);
                    }
                }
            }
            Pane::Comments => {
                let Some(thread) = self.thread.as_mut() else {
                    return;
                };
                let len = thread.comments().len();
                if len == 0 {
                    return;
                }
                self.selected_comment = step(self.selected_comment, delta, len);
                let index = self.selected_comment;
                let Some(id) = thread.comments().get(index).map(|c| c.id.clone()) else {
                    return;
                };
                let height = self.comment_view_height;
                let align = reveal_align(
                    thread.virtualizer().start_of(index),
                    thread.virtualizer().size(index),
                    thread.scroll_offset(),
                    height,
                );
                if let Some(align) = align {
                    thread.scroll_to_comment(&id, align);
                }
            }
        }
    }

    fn page(&mut self, direction: f64) {
        match self.focused_pane {
            Pane::Posts => {
                let height = self.post_view_height.max(LINE_HEIGHT);
                let target = self.feed.scroll_offset() + direction * height;
                self.feed.on_scroll(target);
                let range = self.feed.window().range;
                if !range.empty {
                    self.selected_post = range.start;
                }
            }
            Pane::Comments => {
                if let Some(thread) = self.thread.as_mut() {
                    let height = self.comment_view_height.max(LINE_HEIGHT);
                    thread.on_scroll(thread.scroll_offset() + direction * height);
                    let range = thread.window().range;
                    if !range.empty {
                        self.selected_comment = range.start;
                    }
                }
            }
        }
    }

    fn vote(&mut self, direction: Vote) {
        match self.focused_pane {
            Pane::Posts => {
                if let Some(id) = self.selected_post_id() {
                    self.feed.toggle_vote(&id, direction);
                }
            }
            Pane::Comments => {
                if let Some(id) = self.selected_comment_id() {
                    if let Some(thread) = self.thread.as_mut() {
                        thread.toggle_vote(&id, direction);
                    }
                }
            }
        }
    }

    fn bookmark(&mut self) {
        match self.focused_pane {
            Pane::Posts => {
                if let Some(id) = self.selected_post_id() {
                    self.feed.toggle_bookmark(&id);
                }
            }
            Pane::Comments => {
                if let Some(id) = self.selected_comment_id() {
                    if let Some(thread) = self.thread.as_mut() {
                        thread.toggle_bookmark(&id);
                    }
                }
            }
        }
    }

    fn open_thread(&mut self) {
        let Some(id) = self.selected_post_id() else {
            return;
        };
        if self.thread.as_ref().map(ThreadView::post_id) == Some(id.as_str()) {
            self.focused_pane = Pane::Comments;
            return;
        }
        self.close_thread();
        let mut thread = ThreadView::new(&id, self.services.clone(), self.view_options);
        thread.load_more();
        self.thread = Some(thread);
        self.selected_comment = 0;
        self.focused_pane = Pane::Comments;
        self.set_status(format!("Loading comments for {id}…"));
    }

    fn close_thread(&mut self) {
        if let Some(mut thread) = self.thread.take() {
            thread.unmount();
        }
        self.focused_pane = Pane::Posts;
    }

    fn toggle_replies(&mut self) {
        let Some(id) = self.selected_comment_id() else {
            return;
        };
        if let Some(thread) = self.thread.as_mut() {
            thread.toggle_replies(&id);
        }
    }

    fn set_all_replies(&mut self, expanded: bool) {
        if self.focused_pane != Pane::Comments {
            return;
        }
        let Some(thread) = self.thread.as_mut() else {
            return;
        };
        let changed = if expanded {
            thread.expand_all_replies()
        } else {
            thread.collapse_all_replies()
        };
        if changed > 0 {
            let verb = if expanded { "Expanded" } else { "Collapsed" };
            self.set_status(format!("{verb} {changed} threads"));
        }
    }

    fn remove_selected_comment(&mut self) {
        if self.focused_pane != Pane::Comments {
            return;
        }
        let Some(id) = self.selected_comment_id() else {
            return;
        };
        if let Some(thread) = self.thread.as_mut() {
            if thread.remove_comment(&id) {
                self.set_status("Comment hidden");
            }
        }
    }

    fn play_selected(&mut self, now: Instant) {
        let Some(media_id) = self
            .selected_post()
            .and_then(|post| post.playable_media().next())
            .map(|media| media.id.clone())
        else {
            self.set_status("Selected post has no playable media");
            return;
        };
        // Failures are surfaced as notices by the view.
        if self.feed.play_media(&media_id, now).is_ok() {
            self.set_status(format!("Playing {media_id}"));
        }
    }

    fn retry(&mut self) {
        let retried = match self.focused_pane {
            Pane::Posts => self.feed.retry(),
            Pane::Comments => self
                .thread
                .as_mut()
                .map(ThreadView::retry)
                .unwrap_or(false),
        };
        if retried {
            self.set_status("Retrying…");
        }
    }

    fn apply_filters(&mut self, filters: FeedFilters) {
        let label = filters_label(&filters);
        self.close_thread();
        self.feed.set_filters(filters);
        self.selected_post = 0;
        self.set_status(format!("Feed: {label}"));
    }

    fn draw(&mut self, frame: &mut Frame<'_>) {
        let full = frame.size();
        frame.render_widget(Block::default().style(Style::default().bg(COLOR_BG)), full);

        let layout = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(1),
                Constraint::Min(0),
                Constraint::Length(1),
            ])
            .split(full);

        let status_text = if self.is_loading() {
            format!("{} {}", self.spinner.frame(), self.status_message)
                .trim()
                .to_string()
        } else {
            self.status_message.clone()
        };
        let status_fg = if self.status_is_error {
            COLOR_ERROR
        } else {
            COLOR_TEXT_PRIMARY
        };
        let status_line = Paragraph::new(status_text).style(
            Style::default()
                .fg(status_fg)
                .bg(COLOR_PANEL_FOCUSED_BG)
                .add_modifier(Modifier::BOLD),
        );
        frame.render_widget(status_line, layout[0]);

        let constraints = if self.thread.is_some() {
            [Constraint::Percentage(55), Constraint::Percentage(45)]
        } else {
            [Constraint::Percentage(100), Constraint::Percentage(0)]
        };
        let panes = Layout::default()
            .direction(Direction::Horizontal)
            .constraints(constraints)
            .split(layout[1]);

        self.draw_posts(frame, panes[0]);
        if self.thread.is_some() {
            self.draw_comments(frame, panes[1]);
        }

        let footer = Paragraph::new(self.footer_text())
            .style(
                Style::default()
                    .fg(COLOR_TEXT_SECONDARY)
                    .bg(COLOR_PANEL_BG)
                    .add_modifier(Modifier::ITALIC),
            )
            .alignment(Alignment::Center)
            .wrap(Wrap { trim: true });
        frame.render_widget(footer, layout[2]);
    }

    fn pane_block(&self, pane: Pane, title: String) -> Block<'static> {
        let focused = self.focused_pane == pane;
        let border = if focused {
            COLOR_BORDER_FOCUSED
        } else {
            COLOR_BORDER_IDLE
        };
        Block::default()
            .title(title)
            .borders(Borders::ALL)
            .border_style(Style::default().fg(border))
            .style(Style::default().bg(COLOR_PANEL_BG))
            .padding(Padding::horizontal(1))
    }

    fn draw_posts(&mut self, frame: &mut Frame<'_>, area: Rect) {
        let title = format!(
            "{} · {}",
            Pane::Posts.title(),
            filters_label(self.feed.filters())
        );
        let block = self.pane_block(Pane::Posts, title);
        let inner = block.inner(area);
        frame.render_widget(block, area);

        let width = inner.width.max(1) as usize;
        self.post_view_height = f64::from(inner.height) * LINE_HEIGHT;
        self.feed.set_viewport_height(self.post_view_height);

        let selected = self.selected_post;
        let focused = self.focused_pane == Pane::Posts;
        let mut rendered: HashMap<usize, Vec<Line<'static>>> = HashMap::new();
        let window = self.feed.render_visible(|slot| {
            let highlight = slot.index == selected;
            let players = slot
                .post
                .media
                .iter()
                .map(|media| (media, slot.player(&media.id)))
                .collect::<Vec<_>>();
            let lines = post_lines(slot.post, &slot.engagement, &players, width, highlight, focused);
            let height = lines.len() as f64 * LINE_HEIGHT;
            rendered.insert(slot.index, lines);
            Some(height)
        });

        let mut lines = stitch(&window, &mut rendered, self.feed.scroll_offset());
        if !self.feed.has_more() && !self.feed.posts().is_empty() {
            lines.push(muted_line("No more posts"));
        } else if let Some(err) = self.feed.last_error() {
            lines.push(error_line(format!("Could not load posts: {err}")));
        } else if self.feed.posts().is_empty() && self.feed.is_fetching() {
            lines.push(muted_line("Loading posts…"));
        }
        frame.render_widget(Paragraph::new(lines), inner);
    }

    fn draw_comments(&mut self, frame: &mut Frame<'_>, area: Rect) {
        let Some(thread) = self.thread.as_mut() else {
            return;
        };
        let post_title = self
            .feed
            .post(thread.post_id())
            .map(|post| post.title.clone())
            .unwrap_or_else(|| thread.post_id().to_string());
        let focused = self.focused_pane == Pane::Comments;
        let border = if focused {
            COLOR_BORDER_FOCUSED
        } else {
            COLOR_BORDER_IDLE
        };
        let block = Block::default()
            .title(format!("{} · {}", Pane::Comments.title(), post_title))
            .borders(Borders::ALL)
            .border_style(Style::default().fg(border))
            .style(Style::default().bg(COLOR_PANEL_BG))
            .padding(Padding::horizontal(1));
        let inner = block.inner(area);
        frame.render_widget(block, area);

        let composer_height = if self.composer.is_some() { 3 } else { 0 };
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(0), Constraint::Length(composer_height)])
            .split(inner);
        let list_area = chunks[0];

        let width = list_area.width.max(1) as usize;
        self.comment_view_height = f64::from(list_area.height) * LINE_HEIGHT;
        thread.set_viewport_height(self.comment_view_height);

        let selected = self.selected_comment;
        let mut rendered: HashMap<usize, Vec<Line<'static>>> = HashMap::new();
        let window = thread.render_visible(|slot| {
            let highlight = slot.index == selected && focused;
            let mut lines = comment_lines(slot.comment, &slot.engagement, width, 0, highlight);
            if slot.expanded {
                for reply in &slot.comment.replies {
                    let view = slot.reply_engagement(reply);
                    lines.extend(comment_lines(reply, &view, width, 2, false));
                }
            } else if slot.loading_replies {
                lines.push(muted_line("  Loading replies…"));
            } else if slot.comment.reply_count > 0 {
                lines.push(muted_line(format!(
                    "  ▸ {} repl{} (Enter)",
                    slot.comment.reply_count,
                    if slot.comment.reply_count == 1 { "y" } else { "ies" }
                )));
            }
            lines.push(Line::default());
            let height = lines.len() as f64 * LINE_HEIGHT;
            rendered.insert(slot.index, lines);
            Some(height)
        });

        let mut lines = stitch(&window, &mut rendered, thread.scroll_offset());
        if let Some(err) = thread.last_error() {
            lines.push(error_line(format!("Could not load comments: {err}")));
        } else if thread.comments().is_empty() && !thread.is_fetching() {
            lines.push(muted_line("No comments yet. Press n to write one."));
        }
        frame.render_widget(Paragraph::new(lines), list_area);

        if let Some(composer) = &self.composer {
            let label = match &composer.parent_id {
                Some(parent) => format!("Reply to {parent}"),
                None => "New comment".to_string(),
            };
            let input = Paragraph::new(format!("{}▏", composer.buffer))
                .style(Style::default().fg(COLOR_TEXT_PRIMARY))
                .block(
                    Block::default()
                        .title(format!("{label} · Enter to send, Esc to cancel"))
                        .borders(Borders::TOP)
                        .border_style(Style::default().fg(COLOR_ACCENT)),
                )
                .wrap(Wrap { trim: false });
            frame.render_widget(input, chunks[1]);
        }
    }

    fn footer_text(&self) -> String {
        if self.composer.is_some() {
            return "Type your comment · Enter send · Esc cancel".to_string();
        }
        match self.focused_pane {
            Pane::Posts => "j/k move · u/d vote · b bookmark · c comments · p play · space pause · ←/→ skip · m mute · f fullscreen · s sort · B bookmarks · r retry · q quit".to_string(),
            Pane::Comments => "j/k move · Enter replies · E/C all replies · u/d vote · b bookmark · n comment · R reply · x hide · Tab posts · Esc close · q quit".to_string(),
        }
    }
}

fn step(current: usize, delta: isize, len: usize) -> usize {
    let next = current as isize + delta;
    next.clamp(0, len.saturating_sub(1) as isize) as usize
}

/// Alignment that brings a row fully into view, or `None` when it already is.
fn reveal_align(start: f64, size: f64, scroll: f64, viewport: f64) -> Option<Align> {
    if start < scroll {
        Some(Align::Start)
    } else if start + size > scroll + viewport {
        Some(Align::End)
    } else {
        None
    }
}

/// Joins rendered rows in window order and drops the lines scrolled above the top.
fn stitch(
    window: &VirtualWindow,
    rendered: &mut HashMap<usize, Vec<Line<'static>>>,
    scroll_offset: f64,
) -> Vec<Line<'static>> {
    let mut lines = Vec::new();
    let mut skip = 0usize;
    for (position, item) in window.items.iter().enumerate() {
        let Some(row) = rendered.remove(&item.index) else {
            continue;
        };
        if position == 0 && item.start < scroll_offset {
            skip = ((scroll_offset - item.start) / LINE_HEIGHT).floor() as usize;
        }
        lines.extend(row);
    }
    lines.into_iter().skip(skip).collect()
}

fn filters_label(filters: &FeedFilters) -> String {
    let mut label = match &filters.space {
        Some(space) => format!("{space} · {}", filters.sort.label()),
        None => format!("all spaces · {}", filters.sort.label()),
    };
    if filters.bookmarked_only {
        label.push_str(" · bookmarked");
    }
    label
}

fn muted_line(text: impl Into<String>) -> Line<'static> {
    Line::from(Span::styled(
        text.into(),
        Style::default().fg(COLOR_TEXT_SECONDARY),
    ))
}

fn error_line(text: impl Into<String>) -> Line<'static> {
    Line::from(Span::styled(text.into(), Style::default().fg(COLOR_ERROR)))
}

fn wrap_text(text: &str, width: usize, indent: usize) -> Vec<String> {
    let prefix = " ".repeat(indent);
    let opts = WrapOptions::new(width.max(8))
        .initial_indent(&prefix)
        .subsequent_indent(&prefix);
    wrap(text, opts)
        .into_iter()
        .map(|line| line.into_owned())
        .collect()
}

fn relative_time(created_at: DateTime<Utc>) -> String {
    let elapsed = Utc::now().signed_duration_since(created_at);
    let minutes = elapsed.num_minutes();
    if minutes < 1 {
        "just now".to_string()
    } else if minutes < 60 {
        format!("{minutes}m ago")
    } else if elapsed.num_hours() < 24 {
        format!("{}h ago", elapsed.num_hours())
    } else {
        format!("{}d ago", elapsed.num_days())
    }
}

fn engagement_spans(view: &EngagementView, comments: Option<i64>) -> Vec<Span<'static>> {
    let up_style = if view.tally.vote == Vote::Up {
        Style::default().fg(COLOR_SUCCESS).add_modifier(Modifier::BOLD)
    } else {
        Style::default().fg(COLOR_TEXT_SECONDARY)
    };
    let down_style = if view.tally.vote == Vote::Down {
        Style::default().fg(COLOR_ERROR).add_modifier(Modifier::BOLD)
    } else {
        Style::default().fg(COLOR_TEXT_SECONDARY)
    };
    let mut spans = vec![
        Span::styled(format!("▲ {}", view.tally.up), up_style),
        Span::raw("  "),
        Span::styled(format!("▼ {}", view.tally.down), down_style),
    ];
    if view.vote_pending {
        spans.push(Span::styled(" …", Style::default().fg(COLOR_PENDING)));
    }
    if let Some(count) = comments {
        spans.push(Span::raw("  "));
        spans.push(Span::styled(
            format!("💬 {count}"),
            Style::default().fg(COLOR_TEXT_SECONDARY),
        ));
    }
    let mark = if view.bookmarked { "★" } else { "☆" };
    let mark_style = if view.bookmark_pending {
        Style::default().fg(COLOR_PENDING)
    } else if view.bookmarked {
        Style::default().fg(COLOR_ACCENT)
    } else {
        Style::default().fg(COLOR_TEXT_SECONDARY)
    };
    spans.push(Span::raw("  "));
    spans.push(Span::styled(mark.to_string(), mark_style));
    if view.failed {
        spans.push(Span::styled(
            "  ✗ not saved",
            Style::default().fg(COLOR_ERROR),
        ));
    }
    spans
}

fn post_lines(
    post: &Post,
    engagement: &EngagementView,
    media: &[(&MediaAttachment, Option<&MediaPlaybackController>)],
    width: usize,
    highlight: bool,
    focused: bool,
) -> Vec<Line<'static>> {
    let background = if highlight && focused {
        COLOR_PANEL_SELECTED_BG
    } else {
        COLOR_PANEL_BG
    };
    let title_style = Style::default()
        .fg(if highlight {
            COLOR_ACCENT
        } else {
            COLOR_TEXT_PRIMARY
        })
        .bg(background)
        .add_modifier(Modifier::BOLD);
    let body_style = Style::default().fg(COLOR_TEXT_SECONDARY).bg(background);

    let mut lines = Vec::new();
    let meta = format!(
        "{} · u/{} · {}",
        post.space,
        post.author,
        relative_time(post.created_at)
    );
    lines.push(Line::from(Span::styled(fit_width(&meta, width), body_style)));
    for line in wrap_text(&post.title, width, 0) {
        lines.push(Line::from(Span::styled(line, title_style)));
    }
    let body = wrap_text(&post.body, width, 0);
    let truncated = body.len() > BODY_PREVIEW_LINES;
    for (idx, line) in body.into_iter().take(BODY_PREVIEW_LINES).enumerate() {
        let text = if truncated && idx + 1 == BODY_PREVIEW_LINES {
            format!("{line}…")
        } else {
            line
        };
        lines.push(Line::from(Span::styled(text, body_style)));
    }
    for (attachment, player) in media {
        lines.extend(media_lines(attachment, *player, width));
    }
    lines.push(Line::from(engagement_spans(
        engagement,
        Some(post.comments_count),
    )));
    lines.push(Line::default());
    lines
}

fn media_lines(
    media: &MediaAttachment,
    player: Option<&MediaPlaybackController>,
    width: usize,
) -> Vec<Line<'static>> {
    let label_style = Style::default().fg(COLOR_ACCENT);
    let Some(player) = player else {
        let hint = if media.kind.is_playable() {
            " (p to play)"
        } else {
            ""
        };
        return vec![Line::from(Span::styled(
            fit_width(&format!("▣ {}{hint}", media.label()), width),
            label_style,
        ))];
    };
    if let Some(err) = player.failure() {
        return vec![error_line(format!("▣ {} · {err}", media.label()))];
    }
    let state = player.state();
    let icon = match state.status {
        PlaybackStatus::Poster => "▶",
        PlaybackStatus::Playing => "⏵",
        PlaybackStatus::Paused => "⏸",
        PlaybackStatus::Scrubbing { .. } => "⇆",
    };
    let mut lines = vec![Line::from(Span::styled(
        format!("{icon} {}", media.label()),
        label_style,
    ))];
    if player.overlay_visible() || state.status != PlaybackStatus::Playing {
        let bar_width = PROGRESS_WIDTH.min(width.saturating_sub(20)).max(4);
        let mut controls = format!(
            "  {} {} / {}",
            progress_bar(player.progress(), bar_width),
            format_timestamp(state.current_time),
            format_timestamp(state.duration)
        );
        if state.muted {
            controls.push_str("  muted");
        }
        if state.is_fullscreen {
            controls.push_str("  fullscreen");
        }
        lines.push(muted_line(controls));
    }
    lines
}

fn progress_bar(progress: f64, width: usize) -> String {
    let filled = ((progress.clamp(0.0, 1.0)) * width as f64).round() as usize;
    format!("{}{}", "━".repeat(filled), "─".repeat(width - filled.min(width)))
}

fn comment_lines(
    comment: &CommentNode,
    engagement: &EngagementView,
    width: usize,
    indent: usize,
    highlight: bool,
) -> Vec<Line<'static>> {
    let author_style = Style::default()
        .fg(if highlight {
            COLOR_ACCENT
        } else {
            COLOR_TEXT_PRIMARY
        })
        .add_modifier(Modifier::BOLD);
    let prefix = " ".repeat(indent);
    let mut lines = vec![Line::from(vec![
        Span::raw(prefix.clone()),
        Span::styled(format!("u/{}", comment.author), author_style),
        Span::styled(
            format!(" · {}", relative_time(comment.created_at)),
            Style::default().fg(COLOR_TEXT_SECONDARY),
        ),
    ])];
    for line in wrap_text(&comment.content, width.saturating_sub(indent), indent) {
        lines.push(Line::from(Span::styled(
            line,
            Style::default().fg(COLOR_TEXT_PRIMARY),
        )));
    }
    let mut meta = vec![Span::raw(prefix)];
    meta.extend(engagement_spans(engagement, None));
    lines.push(Line::from(meta));
    lines
}

/// Cuts `text` to `width` display columns, ending in an ellipsis when shortened.
fn fit_width(text: &str, width: usize) -> String {
    if UnicodeWidthStr::width(text) <= width {
        return text.to_string();
    }
    let mut out = String::new();
    let mut used = 0;
    for ch in text.chars() {
        let w = UnicodeWidthChar::width(ch).unwrap_or(0);
        if used + w + 1 > width {
            break;
        }
        used += w;
        out.push(ch);
    }
    out.push('…');
    out
}
