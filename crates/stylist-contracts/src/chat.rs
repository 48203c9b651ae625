/// One parsed line of chat input. Bare text is a fashion question;
/// slash commands drive the image pipeline and housekeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatIntent {
    Ask { query: String },
    Analyze { path: String },
    Recommend { path: String },
    Doctor,
    Help,
    Quit,
    Noop,
    Unknown { command: String },
}

pub const CHAT_HELP: &str = "\
Commands:
  <free text>         ask the stylist a fashion question
  /analyze <path>     describe the clothing in a photo
  /recommend <path>   full pipeline: analysis, advice, product picks
  /doctor             check the configured model endpoints
  /help               show this message
  /quit               leave the chat";

pub fn parse_intent(text: &str) -> ChatIntent {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return ChatIntent::Noop;
    }

    if let Some(slash_tail) = trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let arg = slash_tail[command_len..].trim();
            return match command.as_str() {
                "analyze" => ChatIntent::Analyze {
                    path: parse_path_arg(arg),
                },
                "recommend" => ChatIntent::Recommend {
                    path: parse_path_arg(arg),
                },
                "doctor" => ChatIntent::Doctor,
                "help" => ChatIntent::Help,
                "quit" | "exit" => ChatIntent::Quit,
                _ => ChatIntent::Unknown { command },
            };
        }
    }

    ChatIntent::Ask {
        query: trimmed.to_string(),
    }
}

/// Shell-style path argument: quotes protect embedded spaces; multiple
/// unquoted words are rejoined so `/analyze my photo.png` still resolves.
fn parse_path_arg(arg: &str) -> String {
    if arg.trim().is_empty() {
        return String::new();
    }
    let parts = match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect::<Vec<String>>(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .collect::<Vec<String>>(),
    };
    match parts.len() {
        0 => String::new(),
        1 => parts[0].clone(),
        _ => parts.join(" "),
    }
}
