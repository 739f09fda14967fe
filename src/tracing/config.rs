use serde::Deserialize;

#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub log_level: Option<String>,
    pub color: Option<Color>,
    /// Print the module path of every log line.
    pub with_target: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            log_level: None,
            color: None,
            with_target: true,
        }
    }
}

impl LoggerConfig {
    pub fn with_top_level_directive(&mut self, log_level: Option<String>) -> &mut Self {
        if self.log_level.is_some() && log_level.is_some() {
            eprintln!(
                "Both top-level `log_level` and `logger.log_level` config directives are used. \
                 `logger.log_level` takes priority, so top-level `log_level` will be ignored."
            );
        }

        self.log_level = self.log_level.take().or(log_level);
        self
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(from = "helpers::Color")]
pub enum Color {
    #[default]
    Auto,
    Enable,
    Disable,
}

impl Color {
    pub fn to_bool(self) -> bool {
        match self {
            Self::Auto => colored::control::SHOULD_COLORIZE.should_colorize(),
            Self::Enable => true,
            Self::Disable => false,
        }
    }
}

mod helpers {
    use super::*;

    #[derive(Copy, Clone, Debug, Deserialize)]
    #[serde(untagged)]
    pub enum Color {
        Auto(AutoTag),
        Bool(bool),
    }

    impl From<Color> for super::Color {
        fn from(color: Color) -> Self {
            match color {
                Color::Auto(_) => Self::Auto,
                Color::Bool(true) => Self::Enable,
                Color::Bool(false) => Self::Disable,
            }
        }
    }

    #[derive(Copy, Clone, Debug, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum AutoTag {
        Auto,
    }
}
