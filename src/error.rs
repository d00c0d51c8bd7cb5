#![allow(dead_code)]

use std::env;
use std::io::IsTerminal;

pub type Lc<T> = Result<T, LcException>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LcCode {
    E0101,   // Malformed shape string
    E0201,   // Non-canonical loop
    E0202,   // Region integrity violation
    E0301,   // Divergent execution in lockstep run
    E0302,   // Arithmetic fault during evaluation
    E0303,   // Step budget exhausted
    E9999,   // Internal error
    ICE9001, // Internal transform error
}

impl LcCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::E0101 => "E0101",
            Self::E0201 => "E0201",
            Self::E0202 => "E0202",
            Self::E0301 => "E0301",
            Self::E0302 => "E0302",
            Self::E0303 => "E0303",
            Self::E9999 => "E9999",
            Self::ICE9001 => "ICE9001",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Shape,
    Analysis,
    Normalize,
    Linearize,
    Eval,
    Ice,
}

#[derive(Debug, Clone)]
pub struct LcException {
    pub module: &'static str,
    pub message: String,
    pub code: LcCode,
    pub stage: Stage,
    pub notes: Vec<String>,
}

impl LcException {
    pub fn new(module: &'static str, code: LcCode, stage: Stage, msg: impl Into<String>) -> Self {
        Self {
            module,
            message: msg.into(),
            code,
            stage,
            notes: Vec::new(),
        }
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    fn stage_name(&self) -> &'static str {
        match self.stage {
            Stage::Shape => "Shape",
            Stage::Analysis => "Analysis",
            Stage::Normalize => "Normalize",
            Stage::Linearize => "Linearize",
            Stage::Eval => "Eval",
            Stage::Ice => "ICE",
        }
    }

    pub fn display(&self) {
        let color = color_enabled_stderr();
        let header = if self.code == LcCode::ICE9001 || self.code == LcCode::E9999 {
            "1;97;41"
        } else {
            "1;91"
        };
        eprintln!(
            "{}",
            style(color, header, &format!("** ({}) {}", self.module, self.message))
        );
        eprintln!(
            "{}",
            style(
                color,
                "1;93",
                &format!(
                    "    error[{}]: {} ({})",
                    self.code.as_str(),
                    self.message,
                    self.stage_name()
                ),
            )
        );
        for n in &self.notes {
            eprintln!("{}", style(color, "1;92", &format!("    hint: {}", n)));
        }
    }
}

impl std::fmt::Display for LcException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}) error[{}]: {} ({})",
            self.module,
            self.code.as_str(),
            self.message,
            self.stage_name()
        )
    }
}

fn color_enabled_stderr() -> bool {
    let no_color = env::var_os("NO_COLOR").is_some();
    let force_color = env::var_os("LANEC_FORCE_COLOR").is_some();
    let is_tty = std::io::stderr().is_terminal();
    (is_tty && !no_color) || (force_color && !no_color)
}

fn style(color: bool, code: &str, text: &str) -> String {
    if color {
        format!("\x1b[{}m{}\x1b[0m", code, text)
    } else {
        text.to_string()
    }
}

#[macro_export]
macro_rules! bail {
    ($mod:expr, $code:expr, $stage:expr, $($arg:tt)*) => {
        return Err($crate::error::LcException::new($mod, $code, $stage, format!($($arg)*)))
    };
}

#[macro_export]
macro_rules! ensure {
    ($cond:expr, $mod:expr, $code:expr, $stage:expr, $($arg:tt)*) => {
        if !($cond) {
            return Err($crate::error::LcException::new($mod, $code, $stage, format!($($arg)*)))
        }
    };
}
