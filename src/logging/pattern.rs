use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local};
use log::Record;
use std::fmt::Write;

const ISO8601: &str = "%Y-%m-%d %H:%M:%S,%3f";

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(String),
    Level,
    Date(String),
    Logger,
    Message,
    Thread,
    Newline,
}

/// Padding of a conversion: `%-5level` left-justifies to 5 columns, `%5level` right-justifies.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct Width {
    min: usize,
    left: bool,
}

/// A parsed layout such as `%-5level %date{ISO8601} %logger:  %msg%n`.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    tokens: Vec<(Token, Width)>,
}

impl Pattern {
    pub fn parse(pattern: &str) -> Self {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut chars = pattern.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }
            if chars.peek() == Some(&'%') {
                chars.next();
                literal.push('%');
                continue;
            }

            let mut width = Width::default();
            if chars.peek() == Some(&'-') {
                chars.next();
                width.left = true;
            }
            let mut digits = String::new();
            while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                digits.push(d);
                chars.next();
            }
            width.min = digits.parse().unwrap_or(0);

            let mut word = String::new();
            while let Some(w) = chars.peek().copied().filter(char::is_ascii_alphabetic) {
                word.push(w);
                chars.next();
            }

            let mut option = None;
            if chars.peek() == Some(&'{') {
                chars.next();
                let mut arg = String::new();
                for a in chars.by_ref() {
                    if a == '}' {
                        break;
                    }
                    arg.push(a);
                }
                option = Some(arg);
            }

            let token = match word.as_str() {
                "level" | "le" | "p" => Token::Level,
                "date" | "d" => Token::Date(date_format(option.as_deref())),
                "logger" | "lo" | "c" => Token::Logger,
                "msg" | "message" | "m" => Token::Message,
                "thread" | "t" => Token::Thread,
                "n" => Token::Newline,
                _ => {
                    // unknown conversions are printed as written
                    literal.push('%');
                    literal.push_str(&word);
                    continue;
                }
            };

            if !literal.is_empty() {
                tokens.push((Token::Literal(std::mem::take(&mut literal)), Width::default()));
            }
            tokens.push((token, width));
        }

        if !literal.is_empty() {
            tokens.push((Token::Literal(literal), Width::default()));
        }
        Self { tokens }
    }

    pub fn format(&self, record: &Record) -> String {
        self.format_at(record, Local::now())
    }

    pub(crate) fn format_at(&self, record: &Record, now: DateTime<Local>) -> String {
        let mut out = String::new();
        for (token, width) in &self.tokens {
            let value = match token {
                Token::Literal(text) => {
                    out.push_str(text);
                    continue;
                }
                Token::Newline => {
                    out.push('\n');
                    continue;
                }
                Token::Level => record.level().to_string(),
                Token::Date(format) => now.format(format).to_string(),
                Token::Logger => record.target().to_string(),
                Token::Message => record.args().to_string(),
                Token::Thread => std::thread::current()
                    .name()
                    .unwrap_or("unnamed")
                    .to_string(),
            };
            let _ = if width.left {
                write!(out, "{:<w$}", value, w = width.min)
            } else {
                write!(out, "{:>w$}", value, w = width.min)
            };
        }
        out
    }
}

/// A custom format chrono cannot render falls back to ISO8601.
fn date_format(option: Option<&str>) -> String {
    match option {
        None | Some("ISO8601") | Some("") => ISO8601.to_string(),
        Some(custom) => {
            let format = java_to_strftime(custom);
            if StrftimeItems::new(&format).any(|item| matches!(item, Item::Error)) {
                ISO8601.to_string()
            } else {
                format
            }
        }
    }
}

/// Maps the common `SimpleDateFormat` letters onto strftime.
fn java_to_strftime(format: &str) -> String {
    format
        .replace("yyyy", "%Y")
        .replace("MM", "%m")
        .replace("dd", "%d")
        .replace("HH", "%H")
        .replace("mm", "%M")
        .replace("ss", "%S")
        .replace("SSS", "%3f")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use log::Level;

    fn render(pattern: &str, level: Level, target: &str, message: &str) -> String {
        let now = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let pattern = Pattern::parse(pattern);
        pattern.format_at(
            &Record::builder()
                .level(level)
                .target(target)
                .args(format_args!("{}", message))
                .build(),
            now,
        )
    }

    #[test]
    fn test_default_layout() {
        assert_eq!(
            render(
                "%-5level %date{ISO8601} %logger:  %msg%n",
                Level::Info,
                "croquet::croquet",
                "started"
            ),
            "INFO  2024-03-09 14:05:07,000 croquet::croquet:  started\n"
        );
    }

    #[test]
    fn test_short_conversions_and_padding() {
        assert_eq!(
            render("[%5p] %c - %m", Level::Warn, "crm", "low disk"),
            "[ WARN] crm - low disk"
        );
    }

    #[test]
    fn test_custom_date_and_escapes() {
        assert_eq!(
            render("%d{yyyy-MM-dd} 100%% %m", Level::Debug, "t", "done"),
            "2024-03-09 100% done"
        );
    }

    #[test]
    fn test_unknown_conversion_is_literal() {
        assert_eq!(render("%X{user} %m", Level::Error, "t", "boom"), "%X boom");
    }

    #[test]
    fn test_invalid_date_format_falls_back_to_iso8601() {
        assert_eq!(
            render("%d{%Q} %m", Level::Info, "t", "still logged"),
            "2024-03-09 14:05:07,000 still logged"
        );
        assert_eq!(
            render("%d{HH:mm 50%} %m", Level::Info, "t", "ok"),
            "2024-03-09 14:05:07,000 ok"
        );
    }
}
