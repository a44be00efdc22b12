use serde::Serialize;

/// How command results are printed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    /// Human output without banners and spinners
    Quiet,
    /// One JSON document per command on stdout
    Json,
}

impl OutputMode {
    /// `RELMAP_QUIET=1` (or `true`) has the same effect as `--quiet`
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        let env_quiet = std::env::var("RELMAP_QUIET")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if json {
            OutputMode::Json
        } else if quiet || env_quiet {
            OutputMode::Quiet
        } else {
            OutputMode::Human
        }
    }

    pub fn is_human(self) -> bool {
        !matches!(self, OutputMode::Json)
    }

    pub fn shows_progress(self) -> bool {
        matches!(self, OutputMode::Human)
    }
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    ok: bool,
    command: &'a str,
    data: T,
}

pub fn emit_success<T: Serialize>(mode: OutputMode, command: &str, data: T) -> anyhow::Result<()> {
    if mode == OutputMode::Json {
        let envelope = Envelope {
            ok: true,
            command,
            data,
        };
        println!("{}", serde_json::to_string_pretty(&envelope)?);
    }
    Ok(())
}

pub fn emit_error(mode: OutputMode, command: &str, error: &anyhow::Error) {
    if mode == OutputMode::Json {
        let envelope = Envelope {
            ok: false,
            command,
            data: serde_json::json!({ "error": format!("{error:#}") }),
        };
        match serde_json::to_string_pretty(&envelope) {
            Ok(text) => println!("{text}"),
            Err(_) => println!("{{\"ok\":false}}"),
        }
    } else {
        relmap::ui::error(&format!("{error:#}"));
    }
}
