//! The `Laminafile` build script.
//!
//! ```text
//! # Comment
//! ID web
//! FROM arch
//! RUN pacman -Syu --noconfirm nginx
//! COPY nginx.conf /etc/nginx/
//! UNTAR https://example.org/site.tar.gz#site/public /srv/http
//! SET /etc/hostname "web"
//! ENABLE nginx
//! ```
//!
//! One instruction per line. Blank lines and lines starting with `#` or `.`
//! are skipped. Words are separated by spaces; `"..."` (with `\` escapes),
//! `'...'` and a bare `\` protect spaces.

use std::fmt;
use std::path::Path;

use lamina_common::{LaminaError, LaminaResult};

/// File name of the build script inside a build directory.
pub const LAMINAFILE: &str = "Laminafile";

/// A parsed build instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// `ID name`: name of the image being built.
    Id(String),
    /// `FROM base`: the base image.
    From(String),
    /// `NAME tag`: tag re-pointed at the result (defaults to the ID).
    Name(String),
    /// `VERSION version`: appended to the tag as `NAME-VERSION`.
    Version(String),
    /// `RUN program [args]`: run inside the image.
    Run {
        /// Program to run.
        program: String,
        /// Its arguments.
        args: Vec<String>,
    },
    /// `COPY src... dest`: copy from the build directory into the image.
    Copy {
        /// Paths relative to the build directory.
        sources: Vec<String>,
        /// Absolute destination inside the image.
        dest: String,
    },
    /// `UNTAR src... dest`: unpack archives into the image.
    Untar {
        /// Paths relative to the build directory or `http(s)` URLs, with an
        /// optional `#subdir`.
        sources: Vec<String>,
        /// Absolute destination inside the image.
        dest: String,
    },
    /// `SET path value`: write a file inside the image.
    Set {
        /// Absolute path inside the image.
        path: String,
        /// File content.
        value: String,
    },
    /// `ADD_UNIT name`: install a unit file from the build directory.
    AddUnit(String),
    /// `ENABLE name`: install (if present) and enable a unit.
    Enable(String),
}

impl Instruction {
    /// Build an instruction from its words.
    ///
    /// Arguments beyond the ones an instruction uses are ignored.
    ///
    /// # Errors
    ///
    /// Fails with [`LaminaError::NotEnoughArguments`] or
    /// [`LaminaError::UnknownInstruction`].
    pub fn from_words(words: &[String]) -> LaminaResult<Self> {
        let Some((word, args)) = words.split_first() else {
            return Err(LaminaError::UnknownInstruction {
                instruction: String::new(),
            });
        };

        let need = |expected: usize| {
            if args.len() < expected {
                Err(LaminaError::NotEnoughArguments {
                    instruction: word.clone(),
                    expected,
                })
            } else {
                Ok(())
            }
        };

        let instruction = match word.as_str() {
            "ID" => {
                need(1)?;
                Self::Id(args[0].clone())
            }
            "FROM" => {
                need(1)?;
                Self::From(args[0].clone())
            }
            "NAME" => {
                need(1)?;
                Self::Name(args[0].clone())
            }
            "VERSION" => {
                need(1)?;
                Self::Version(args[0].clone())
            }
            "RUN" => {
                need(1)?;
                Self::Run {
                    program: args[0].clone(),
                    args: args[1..].to_vec(),
                }
            }
            "COPY" | "UNTAR" => {
                need(2)?;
                let (dest, sources) = args.split_last().map_or_else(
                    || (String::new(), Vec::new()),
                    |(dest, sources)| (dest.clone(), sources.to_vec()),
                );
                if word == "COPY" {
                    Self::Copy { sources, dest }
                } else {
                    Self::Untar { sources, dest }
                }
            }
            "SET" => {
                need(2)?;
                Self::Set {
                    path: args[0].clone(),
                    value: args[1].clone(),
                }
            }
            "ADD_UNIT" => {
                need(1)?;
                Self::AddUnit(args[0].clone())
            }
            "ENABLE" => {
                need(1)?;
                Self::Enable(args[0].clone())
            }
            _ => {
                return Err(LaminaError::UnknownInstruction {
                    instruction: word.clone(),
                });
            }
        };
        Ok(instruction)
    }

    /// Whether the instruction only describes the build and needs no image.
    #[must_use]
    pub const fn is_meta(&self) -> bool {
        matches!(
            self,
            Self::Id(_) | Self::From(_) | Self::Name(_) | Self::Version(_)
        )
    }
}

/// One line of a build script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// 1-based line number.
    pub line: usize,
    /// The words as written.
    pub words: Vec<String>,
    /// The instruction they form.
    pub instruction: Instruction,
}

impl fmt::Display for Step {
    /// `WORD (arg) (arg)`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some((word, args)) = self.words.split_first() else {
            return Ok(());
        };
        f.write_str(word)?;
        for arg in args {
            write!(f, " ({arg})")?;
        }
        Ok(())
    }
}

/// A parsed build script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Laminafile {
    /// Steps in file order.
    pub steps: Vec<Step>,
}

impl Laminafile {
    /// Parse a build script.
    ///
    /// # Errors
    ///
    /// Returns the first syntax or instruction error.
    pub fn parse(content: &str) -> LaminaResult<Self> {
        let mut steps = Vec::new();

        for (index, raw) in content.lines().enumerate() {
            let line = index + 1;
            if raw.trim().is_empty() || raw.starts_with('#') || raw.starts_with('.') {
                continue;
            }

            let words = split_words(raw).map_err(|message| LaminaError::Parse { line, message })?;
            let instruction = Instruction::from_words(&words).inspect_err(|e| {
                tracing::debug!(line, error = %e, "Invalid build instruction");
            })?;
            steps.push(Step {
                line,
                words,
                instruction,
            });
        }

        Ok(Self { steps })
    }

    /// Read and parse `<dir>/Laminafile`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or parsed.
    pub fn load(dir: &Path) -> LaminaResult<Self> {
        let path = dir.join(LAMINAFILE);
        let content = std::fs::read_to_string(&path)?;
        tracing::debug!(path = %path.display(), "Parsing build script");
        Self::parse(&content)
    }
}

/// Split a line into words.
///
/// # Errors
///
/// Returns a message for an unterminated quote.
pub fn split_words(line: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut word = String::new();
    // Whether the current word had a quoted part, so `""` is kept.
    let mut quoted = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                quoted = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => {
                            if let Some(escaped) = chars.next() {
                                word.push(escaped);
                            }
                        }
                        Some(other) => word.push(other),
                        None => return Err("unterminated double quote".to_string()),
                    }
                }
            }
            '\'' => {
                quoted = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(other) => word.push(other),
                        None => return Err("unterminated single quote".to_string()),
                    }
                }
            }
            '\\' => {
                if let Some(escaped) = chars.next() {
                    word.push(escaped);
                }
            }
            ' ' => {
                if !word.is_empty() || quoted {
                    words.push(std::mem::take(&mut word));
                }
                quoted = false;
            }
            other => word.push(other),
        }
    }

    if !word.is_empty() || quoted {
        words.push(word);
    }
    Ok(words)
}
