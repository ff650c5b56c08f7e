use std::io::{self, Write};

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyModifiers, MouseButton, MouseEvent, MouseEventKind},
    terminal::{Clear, ClearType},
};
use mangaterm_core::{GestureEvent, ReaderCommand, RenderImage};
use png::{BitDepth, ColorType, Encoder};
use tracing::trace;

pub struct KittyRenderer<W: Write> {
    writer: W,
    next_image_id: u32,
}

const KITTY_CHUNK: usize = 4096;

fn encode_png(image: &RenderImage) -> Result<Vec<u8>> {
    let mut png = Vec::new();
    {
        let mut encoder = Encoder::new(&mut png, image.width, image.height);
        encoder.set_color(ColorType::Rgba);
        encoder.set_depth(BitDepth::Eight);
        let mut stream = encoder.write_header()?;
        stream.write_image_data(&image.pixels)?;
        stream.finish()?;
    }
    Ok(png)
}

pub struct DrawParams {
    pub columns: u32,
    pub rows: u32,
}

impl DrawParams {
    pub fn clamped(columns: u32, rows: u32) -> Self {
        Self {
            columns: columns.max(1),
            rows: rows.max(1),
        }
    }
}

impl<W: Write> KittyRenderer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            next_image_id: 1,
        }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn begin_frame(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}_Ga=d,d=A,q=2\u{1b}\\")?;
        self.next_image_id = 1;
        Ok(())
    }

    pub fn draw(&mut self, image: &RenderImage, params: DrawParams) -> Result<()> {
        let payload = BASE64.encode(encode_png(image)?);
        let image_id = self.next_image_id;
        self.next_image_id = self.next_image_id.wrapping_add(1).max(1);
        trace!(
            image_id,
            columns = params.columns,
            rows = params.rows,
            payload = payload.len(),
            "placing image"
        );

        let chunks: Vec<&[u8]> = payload.as_bytes().chunks(KITTY_CHUNK).collect();
        let last = chunks.len().saturating_sub(1);
        for (position, chunk) in chunks.iter().enumerate() {
            let more = u8::from(position < last);
            if position == 0 {
                write!(
                    self.writer,
                    "\u{1b}_Ga=T,f=100,C=1,q=2,i={image_id},p=1,c={},r={},s={},v={},z=-1,m={more};",
                    params.columns, params.rows, image.width, image.height,
                )?;
            } else {
                write!(self.writer, "\u{1b}_Gm={more},q=2;")?;
            }
            self.writer.write_all(chunk)?;
            self.writer.write_all(b"\x1b\\")?;
        }
        self.writer.flush()?;
        Ok(())
    }

    pub fn begin_sync_update(&mut self) -> Result<()> {
        self.writer.write_all(b"\x1b[?2026h")?;
        Ok(())
    }

    pub fn end_sync_update(&mut self) -> Result<()> {
        self.writer.write_all(b"\x1b[?2026l")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn clear_all(&mut self) -> Result<()> {
        crossterm::queue!(self.writer, Clear(ClearType::All), cursor::MoveTo(0, 0))?;
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellSize {
    pub width: f64,
    pub height: f64,
}

impl Default for CellSize {
    fn default() -> Self {
        Self {
            width: 8.0,
            height: 16.0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum UiEvent {
    Command(ReaderCommand),
    Gesture(GestureEvent),
    Resize { columns: u16, rows: u16 },
    SaveImage,
    ToggleFavorite,
    Quit,
    None,
}

#[derive(Debug, Default)]
pub struct EventMapper {
    count: CountPrefix,
    cell: CellSize,
    page_rows: u16,
}

impl EventMapper {
    const LINE_STEP: f64 = 48.0;
    const WHEEL_STEP: f64 = 96.0;

    pub fn new() -> Self {
        Self::default()
    }

    /// `page_rows` is the height of the page area; its first and last rows map
    /// to the top and bottom edge of the viewport so a drag can reach both ends.
    pub fn set_screen(&mut self, cell: CellSize, page_rows: u16) {
        self.cell = cell;
        self.page_rows = page_rows;
    }

    fn row_to_y(&self, row: u16) -> f64 {
        match self.page_rows {
            0 => (f64::from(row) + 0.5) * self.cell.height,
            1 => 0.0,
            rows => {
                let span = f64::from(rows) * self.cell.height;
                f64::from(row) / f64::from(rows - 1) * span
            }
        }
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Key(key) => self.map_key(key),
            Event::Mouse(mouse) => self.map_mouse(mouse),
            Event::Resize(columns, rows) => UiEvent::Resize { columns, rows },
            _ => UiEvent::None,
        }
    }

    fn map_key(&mut self, key: KeyEvent) -> UiEvent {
        if key.modifiers.contains(KeyModifiers::CONTROL) {
            self.count.clear();
            return match key.code {
                KeyCode::Char('c') => UiEvent::Quit,
                _ => UiEvent::None,
            };
        }
        if let KeyCode::Char(digit @ '0'..='9') = key.code {
            self.count.push(digit);
            return UiEvent::None;
        }

        let command = match key.code {
            KeyCode::Char('j') | KeyCode::Down => ReaderCommand::ScrollBy {
                pixels: Self::LINE_STEP * self.count.take() as f64,
            },
            KeyCode::Char('k') | KeyCode::Up => ReaderCommand::ScrollBy {
                pixels: -Self::LINE_STEP * self.count.take() as f64,
            },
            KeyCode::Char(' ') | KeyCode::PageDown => ReaderCommand::ScrollScreens {
                screens: self.count.take() as f64,
            },
            KeyCode::Char('b') | KeyCode::PageUp => ReaderCommand::ScrollScreens {
                screens: -(self.count.take() as f64),
            },
            KeyCode::Char('n') => ReaderCommand::NextPage {
                count: self.count.take(),
            },
            KeyCode::Char('p') => ReaderCommand::PrevPage {
                count: self.count.take(),
            },
            // `12g` jumps to page 12.
            KeyCode::Char('g') | KeyCode::Home => ReaderCommand::GotoPage {
                page: self.count.explicit().map_or(0, |page| page - 1),
            },
            KeyCode::Char('G') | KeyCode::End => {
                self.count.clear();
                ReaderCommand::GotoPage { page: usize::MAX }
            }
            other => {
                self.count.clear();
                return match other {
                    KeyCode::Char('s') => UiEvent::SaveImage,
                    KeyCode::Char('f') => UiEvent::ToggleFavorite,
                    KeyCode::Char('q') | KeyCode::Esc => UiEvent::Quit,
                    _ => UiEvent::None,
                };
            }
        };
        UiEvent::Command(command)
    }

    fn map_mouse(&mut self, mouse: MouseEvent) -> UiEvent {
        let x = (f64::from(mouse.column) + 0.5) * self.cell.width;
        let y = self.row_to_y(mouse.row);
        match mouse.kind {
            MouseEventKind::Down(MouseButton::Left) | MouseEventKind::Drag(MouseButton::Left) => {
                UiEvent::Gesture(GestureEvent::Move { x, y })
            }
            MouseEventKind::Up(MouseButton::Left) => UiEvent::Gesture(GestureEvent::Release),
            MouseEventKind::ScrollDown => UiEvent::Command(ReaderCommand::ScrollBy {
                pixels: Self::WHEEL_STEP,
            }),
            MouseEventKind::ScrollUp => UiEvent::Command(ReaderCommand::ScrollBy {
                pixels: -Self::WHEEL_STEP,
            }),
            _ => UiEvent::None,
        }
    }

    pub fn pending_input(&self) -> Option<String> {
        self.count.shown()
    }
}

#[derive(Debug, Default)]
struct CountPrefix {
    digits: String,
}

impl CountPrefix {
    const MAX_DIGITS: usize = 9;

    fn push(&mut self, digit: char) {
        if self.digits.len() < Self::MAX_DIGITS {
            self.digits.push(digit);
        }
    }

    fn explicit(&mut self) -> Option<usize> {
        let count = self.digits.parse().ok().filter(|&count: &usize| count > 0);
        self.digits.clear();
        count
    }

    fn take(&mut self) -> usize {
        self.explicit().unwrap_or(1)
    }

    fn clear(&mut self) {
        self.digits.clear();
    }

    fn shown(&self) -> Option<String> {
        (!self.digits.is_empty()).then(|| self.digits.clone())
    }
}

pub fn write_status_line<W: Write>(writer: &mut W, status: &str) -> io::Result<()> {
    writer.write_all(status.as_bytes())?;
    writer.flush()
}
