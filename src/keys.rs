//! Key names as the model writes them (`Return`, `cmd+shift+t`, `f5`) and
//! the chords they decompose into.

use std::fmt;

use serde::Serialize;

use crate::error::KeyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Modifier {
    Cmd,
    Ctrl,
    Alt,
    Shift,
    Fn,
}

impl Modifier {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "cmd" | "command" | "meta" | "super" | "win" => Some(Modifier::Cmd),
            "ctrl" | "control" => Some(Modifier::Ctrl),
            "alt" | "option" | "opt" => Some(Modifier::Alt),
            "shift" => Some(Modifier::Shift),
            "fn" => Some(Modifier::Fn),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Modifier::Cmd => "cmd",
            Modifier::Ctrl => "ctrl",
            Modifier::Alt => "alt",
            Modifier::Shift => "shift",
            Modifier::Fn => "fn",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NamedKey {
    Return,
    Tab,
    Space,
    Escape,
    Backspace,
    ForwardDelete,
    Home,
    End,
    PageUp,
    PageDown,
    ArrowUp,
    ArrowDown,
    ArrowLeft,
    ArrowRight,
    F(u8),
}

impl NamedKey {
    pub fn parse(name: &str) -> Option<Self> {
        let lower = name.trim().to_lowercase();
        let key = match lower.as_str() {
            "return" | "enter" | "kp_enter" => NamedKey::Return,
            "tab" => NamedKey::Tab,
            "space" => NamedKey::Space,
            "escape" | "esc" => NamedKey::Escape,
            "backspace" | "delete" | "back" => NamedKey::Backspace,
            "forwarddelete" | "fwd-delete" | "del" => NamedKey::ForwardDelete,
            "home" => NamedKey::Home,
            "end" => NamedKey::End,
            "pageup" | "page_up" | "prior" | "pgup" => NamedKey::PageUp,
            "pagedown" | "page_down" | "next" | "pgdn" => NamedKey::PageDown,
            "up" | "arrowup" | "arrow-up" => NamedKey::ArrowUp,
            "down" | "arrowdown" | "arrow-down" => NamedKey::ArrowDown,
            "left" | "arrowleft" | "arrow-left" => NamedKey::ArrowLeft,
            "right" | "arrowright" | "arrow-right" => NamedKey::ArrowRight,
            s if s.len() > 1 && s.starts_with('f') => match s[1..].parse::<u8>() {
                Ok(n) if (1..=24).contains(&n) => NamedKey::F(n),
                _ => return None,
            },
            _ => return None,
        };
        Some(key)
    }
}

/// A single key on the keyboard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Key {
    Modifier(Modifier),
    Named(NamedKey),
    Char(char),
}

impl Key {
    pub fn parse(name: &str) -> Result<Self, KeyError> {
        // A lone space is a real key, so only trim when there is something else.
        let trimmed = if name.trim().is_empty() { name } else { name.trim() };
        if trimmed.is_empty() {
            return Err(KeyError::Empty);
        }

        let mut chars = trimmed.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            return Ok(Key::Char(c));
        }

        if let Some(m) = Modifier::parse(trimmed) {
            return Ok(Key::Modifier(m));
        }
        NamedKey::parse(trimmed)
            .map(Key::Named)
            .ok_or_else(|| KeyError::Unknown(trimmed.to_string()))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Modifier(m) => f.write_str(m.as_str()),
            Key::Named(NamedKey::F(n)) => write!(f, "f{n}"),
            Key::Named(named) => write!(f, "{named:?}"),
            Key::Char(c) => write!(f, "{c}"),
        }
    }
}

/// Zero or more modifiers held around one base key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyChord {
    pub modifiers: Vec<Modifier>,
    pub key: Key,
}

impl KeyChord {
    /// Parses `key` or `mod+mod+key`. `ctrl++` presses ctrl and plus.
    pub fn parse(text: &str) -> Result<Self, KeyError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Key::parse(text).map(|key| KeyChord {
                modifiers: Vec::new(),
                key,
            });
        }

        let (head, base) = if let Some(head) = trimmed.strip_suffix("++") {
            (head, "+")
        } else if trimmed == "+" {
            ("", "+")
        } else {
            trimmed.rsplit_once('+').unwrap_or(("", trimmed))
        };

        let mut modifiers = Vec::new();
        for part in head.split('+').filter(|p| !p.trim().is_empty()) {
            let m = Modifier::parse(part).ok_or_else(|| KeyError::NotAModifier(part.to_string()))?;
            if !modifiers.contains(&m) {
                modifiers.push(m);
            }
        }

        Ok(KeyChord {
            modifiers,
            key: Key::parse(base)?,
        })
    }

    pub fn is_combo(&self) -> bool {
        !self.modifiers.is_empty()
    }

    /// Keys in the order they go down. Release happens in the reverse order.
    pub fn presses(&self) -> Vec<Key> {
        self.modifiers
            .iter()
            .copied()
            .map(Key::Modifier)
            .chain(std::iter::once(self.key.clone()))
            .collect()
    }
}

impl fmt::Display for KeyChord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for m in &self.modifiers {
            write!(f, "{}+", m.as_str())?;
        }
        write!(f, "{}", self.key)
    }
}
