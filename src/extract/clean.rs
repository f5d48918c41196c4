use std::fmt::{Display, Formatter};

use once_cell::sync::Lazy;
use regex::Regex;

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<?https?://[^\s<>]+>?").expect("compile url regex"));
static UNSUBSCRIBE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)unsubscribe|descadastr|cancelar (?:a )?inscri[çc][ãa]o|opt[- ]out")
        .expect("compile unsubscribe regex")
});
static BANNER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^[\s>]*(?:-{3,}\s*(?:forwarded message|mensagem encaminhada|original message|mensagem original)\s*-{3,}|(?:begin forwarded message|in[íi]cio da mensagem encaminhada):)\s*$",
    )
    .expect("compile banner regex")
});
static HEADER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^[\s>]*\*?(from|de|to|para|cc|cco|bcc|subject|assunto|date|data|sent|enviado(?: em)?|enviada(?: em)?|reply-to)\*?\s*:(.*)$",
    )
    .expect("compile header regex")
});
static ATTRIBUTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[\s>]*(?:on\s.+\swrote|em\s.+\sescreveu)\s*:\s*$")
        .expect("compile attribution regex")
});
static SIGN_OFF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(?:--|atenciosamente|att\.?|atte\.?|abra[çc]os?|cordialmente|sauda[çc][õo]es|best regards|kind regards|regards|sincerely|cheers|sent from my .+|enviado do meu .+|enviado de meu .+)[,.!]*$",
    )
    .expect("compile sign-off regex")
});
static HORIZONTAL_WS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\S\n]+").expect("compile whitespace regex"));

/// Message text with forwarding noise, quoted headers, tracking links and
/// trailing signatures removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanedBody(String);

impl CleanedBody {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl AsRef<str> for CleanedBody {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for CleanedBody {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cleans `body` to a fixed point, so `clean(clean(x)) == clean(x)`.
///
/// A pass never lengthens the text, so the loop ends once a pass leaves it
/// unchanged.
pub fn clean(body: &str) -> CleanedBody {
    let mut current = body.replace("\r\n", "\n").replace('\r', "\n");

    loop {
        let next = clean_pass(&current);
        if next == current {
            break;
        }
        current = next;
    }

    CleanedBody(current)
}

fn clean_pass(text: &str) -> String {
    let lines: Vec<String> = text
        .lines()
        .map(|line| URL_RE.replace_all(line, "").into_owned())
        .filter(|line| !UNSUBSCRIBE_RE.is_match(line))
        .collect();

    let lines = drop_banner_blocks(lines);
    let lines = drop_header_blocks(lines);
    let lines: Vec<String> = lines
        .into_iter()
        .filter(|line| !ATTRIBUTION_RE.is_match(line))
        .collect();
    let lines = truncate_after_signature(lines);

    normalize_whitespace(&lines)
}

fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

/// Removes each forwarding banner and the header lines that follow it up to
/// the first blank line.
fn drop_banner_blocks(lines: Vec<String>) -> Vec<String> {
    let mut kept = Vec::with_capacity(lines.len());
    let mut in_block = false;

    for line in lines {
        if BANNER_RE.is_match(&line) {
            in_block = true;
            continue;
        }
        if in_block {
            if is_blank(&line) {
                in_block = false;
            } else {
                continue;
            }
        }
        kept.push(line);
    }

    kept
}

/// Removes runs of quoted header lines (with folded continuations) that look
/// like a message header: a `From`/`De` line plus either an address in it or
/// at least three header lines. A lone `Data: 24/11` line is left alone.
fn drop_header_blocks(lines: Vec<String>) -> Vec<String> {
    let mut kept = Vec::with_capacity(lines.len());
    let mut index = 0;

    while index < lines.len() {
        if !HEADER_RE.is_match(&lines[index]) {
            kept.push(lines[index].clone());
            index += 1;
            continue;
        }

        let start = index;
        let mut header_lines = 0;
        let mut from_with_address = false;
        let mut has_from = false;
        while index < lines.len() {
            let line = &lines[index];
            if let Some(captures) = HEADER_RE.captures(line) {
                header_lines += 1;
                let name = captures[1].to_ascii_lowercase();
                if name == "from" || name == "de" {
                    has_from = true;
                    from_with_address |= captures[2].contains('@');
                }
            } else if index > start
                && !is_blank(line)
                && line.starts_with([' ', '\t'])
            {
                // folded continuation of the previous header
            } else {
                break;
            }
            index += 1;
        }

        if !(has_from && (from_with_address || header_lines >= 3)) {
            kept.extend(lines[start..index].iter().cloned());
        }
    }

    kept
}

/// Keeps text up to and including the last signature delimiter or sign-off
/// line; whatever follows it is signature or quoted history.
fn truncate_after_signature(mut lines: Vec<String>) -> Vec<String> {
    if let Some(last) = lines
        .iter()
        .rposition(|line| SIGN_OFF_RE.is_match(line.trim()))
    {
        lines.truncate(last + 1);
    }
    lines
}

fn normalize_whitespace(lines: &[String]) -> String {
    let mut out: Vec<String> = Vec::with_capacity(lines.len());

    for line in lines {
        let collapsed = HORIZONTAL_WS_RE.replace_all(line, " ");
        let collapsed = collapsed.trim_end();
        if collapsed.is_empty() && out.last().map_or(true, |prev| prev.is_empty()) {
            continue;
        }
        out.push(collapsed.to_string());
    }

    while out.last().is_some_and(|line| line.is_empty()) {
        out.pop();
    }

    out.join("\n").trim().to_string()
}
