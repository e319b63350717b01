//! Interactive console conversation about one image at a time.

use std::io::{BufRead, Write};

use kornia_image::{Image, allocator::CpuAllocator};

use crate::analyzer::Analyzer;
use crate::error::VqaError;
use crate::generation::GenerationConfig;
use crate::image_io::read_image_rgb8;
use crate::model::VisionLanguageModel;

pub const IMAGE_PROMPT: &str = "Image path >>>>> ";
pub const QUERY_PROMPT: &str = "Human: ";

const CLEAR_COMMAND: &str = "clear";
const EXIT_COMMANDS: &[&str] = &["exit", "quit"];

/// Where the conversation stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatState {
    /// Waiting for the path of the image to talk about.
    AwaitingImage,
    /// An image is bound, every line is a query.
    Conversing,
    /// No image was given, the next query is refused.
    TextOnly,
    /// The user left.
    Exited,
}

/// A read-eval loop that binds an image and answers queries about it.
pub struct ChatLoop<'a, M: VisionLanguageModel> {
    analyzer: &'a mut Analyzer<M>,
    config: GenerationConfig,
    state: ChatState,
    image: Option<Image<u8, 3, CpuAllocator>>,
    history: Vec<(String, String)>,
}

impl<'a, M: VisionLanguageModel> ChatLoop<'a, M> {
    pub fn new(analyzer: &'a mut Analyzer<M>, config: GenerationConfig) -> Self {
        Self {
            analyzer,
            config,
            state: ChatState::AwaitingImage,
            image: None,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> ChatState {
        self.state
    }

    /// The (query, answer) turns about the current image.
    pub fn history(&self) -> &[(String, String)] {
        &self.history
    }

    /// The prompt to show before reading the next line.
    pub fn prompt(&self) -> Option<&'static str> {
        match self.state {
            ChatState::AwaitingImage => Some(IMAGE_PROMPT),
            ChatState::Conversing | ChatState::TextOnly => Some(QUERY_PROMPT),
            ChatState::Exited => None,
        }
    }

    /// Reads lines from `input` until an exit command or the end of input.
    pub fn run<R: BufRead, W: Write>(
        &mut self,
        mut input: R,
        out: &mut W,
    ) -> Result<(), VqaError> {
        let mut line = String::new();
        while let Some(prompt) = self.prompt() {
            write!(out, "{prompt}")?;
            out.flush()?;

            line.clear();
            if input.read_line(&mut line)? == 0 {
                writeln!(out)?;
                self.state = ChatState::Exited;
                break;
            }
            self.handle_line(line.trim_end_matches(['\r', '\n']), out)?;
        }
        Ok(())
    }

    /// Applies one line of user input.
    ///
    /// Failures of a single turn are reported to `out` and leave the loop usable, only
    /// errors writing to `out` are returned.
    pub fn handle_line<W: Write>(&mut self, line: &str, out: &mut W) -> Result<(), VqaError> {
        if EXIT_COMMANDS.contains(&line.trim()) {
            self.state = ChatState::Exited;
            return Ok(());
        }

        match self.state {
            ChatState::AwaitingImage => self.bind_image(line, out),
            ChatState::TextOnly => {
                if line.trim() != CLEAR_COMMAND {
                    writeln!(
                        out,
                        "Image not provided. Please provide an image path to continue."
                    )?;
                }
                self.reset();
                Ok(())
            }
            ChatState::Conversing => {
                if line.trim() == CLEAR_COMMAND {
                    self.reset();
                    return Ok(());
                }
                self.ask(line, out)
            }
            ChatState::Exited => Ok(()),
        }
    }

    fn bind_image<W: Write>(&mut self, path: &str, out: &mut W) -> Result<(), VqaError> {
        let path = path.trim();
        if path.is_empty() {
            writeln!(
                out,
                "You did not enter an image path, the following will be a plain text conversation."
            )?;
            self.state = ChatState::TextOnly;
            return Ok(());
        }

        match read_image_rgb8(path) {
            Ok(image) => {
                log::debug!("Bound image {path} ({}x{})", image.width(), image.height());
                writeln!(out, "{path}")?;
                self.image = Some(image);
                self.history.clear();
                self.state = ChatState::Conversing;
            }
            Err(e) => {
                log::error!("Failed to load {path}: {e}");
                writeln!(out, "Failed to load image {path}: {e}")?;
            }
        }
        Ok(())
    }

    fn ask<W: Write>(&mut self, query: &str, out: &mut W) -> Result<(), VqaError> {
        let Some(image) = self.image.as_ref() else {
            self.reset();
            return Ok(());
        };

        match self.analyzer.answer(image, query, &self.config) {
            Ok(response) => {
                writeln!(out, "Assistant: {response}")?;
                self.history.push((query.to_string(), response));
            }
            Err(e) => {
                log::error!("Failed to answer: {e}");
                writeln!(out, "Error: {e}")?;
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.image = None;
        self.history.clear();
        self.state = ChatState::AwaitingImage;
    }
}
