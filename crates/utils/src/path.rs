use std::fmt::Display;

use anyhow::Result;

/// Helper to format a single word of a command line that is going to be
/// interpreted by a POSIX shell, typically on a remote host.
#[derive(Debug)]
pub struct ShellQuoted<'a> {
    word: &'a str,
}

impl<'a> Display for ShellQuoted<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.word.is_empty()
            && self
                .word
                .chars()
                .all(|c| matches!(c, '/' | '.' | '-' | '_' | '=' | ':' | ',' | '+' | '@') || c.is_ascii_alphanumeric())
        {
            return f.write_str(self.word);
        }
        match shlex::try_quote(self.word) {
            Ok(r) => f.write_str(&r),
            // Only happens for embedded NUL bytes, which no shell can represent
            Err(_) => Err(std::fmt::Error),
        }
    }
}

impl<'a> ShellQuoted<'a> {
    /// Given a word, quote it in a way that it would be parsed by a default
    /// POSIX shell. If the word has no spaces or shell meta-characters,
    /// it will be exactly the same as the input.
    pub fn new<S: AsRef<str> + ?Sized>(word: &'a S) -> ShellQuoted<'a> {
        ShellQuoted {
            word: word.as_ref(),
        }
    }
}

/// Join an argument vector into a single shell command line, quoting each
/// word as needed.
pub fn shell_join<S: AsRef<str>>(argv: &[S]) -> Result<String> {
    let mut r = String::new();
    for (i, word) in argv.iter().enumerate() {
        let word = word.as_ref();
        if word.contains('\0') {
            anyhow::bail!("Command word contains a NUL byte: {word:?}");
        }
        if i > 0 {
            r.push(' ');
        }
        r.push_str(&ShellQuoted::new(word).to_string());
    }
    Ok(r)
}
