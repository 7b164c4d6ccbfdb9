//! Interactive control line parsing

/// One line typed at the control prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Quit,
    Status,
    /// Trigger the listed cameras; `rejected` holds tokens that are not indices
    Trigger {
        indices: Vec<usize>,
        rejected: Vec<String>,
    },
    Empty,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        match line.to_ascii_lowercase().as_str() {
            "" => return Command::Empty,
            "q" | "quit" | "exit" => return Command::Quit,
            "s" | "status" => return Command::Status,
            _ => {}
        }

        let mut indices = Vec::new();
        let mut rejected = Vec::new();
        for token in line.split_whitespace() {
            match token.parse::<usize>() {
                Ok(index) => indices.push(index),
                Err(_) => rejected.push(token.to_string()),
            }
        }

        if indices.is_empty() {
            Command::Unknown(line.to_string())
        } else {
            Command::Trigger { indices, rejected }
        }
    }
}
