//! Context windows around matching lines of a file

use serde::Serialize;

/// A run of consecutive lines around one or more matches
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextPreview {
    /// Zero-based line number of the first line in `preview`
    pub offset: usize,
    pub preview: String,
    /// Zero-based line numbers of the matching lines
    pub hits: Vec<usize>,
}

/// Collect `before`/`after` lines of context around every line for which
/// `matches` holds; windows that overlap or touch are merged
pub fn filter_text_preview<F>(text: &str, matches: F, before: usize, after: usize) -> Vec<TextPreview>
where
    F: Fn(&str) -> bool,
{
    let lines: Vec<&str> = text.lines().collect();
    let Some(last) = lines.len().checked_sub(1) else {
        return Vec::new();
    };

    let mut previews = Vec::new();
    // (start, end inclusive, hits)
    let mut window: Option<(usize, usize, Vec<usize>)> = None;

    for (number, line) in lines.iter().enumerate() {
        if !matches(line) {
            continue;
        }
        let start = number.saturating_sub(before);
        let end = (number + after).min(last);

        window = match window.take() {
            Some((open_start, open_end, mut hits)) if start <= open_end + 1 => {
                hits.push(number);
                Some((open_start, open_end.max(end), hits))
            }
            Some(closed) => {
                previews.push(render(&lines, closed));
                Some((start, end, vec![number]))
            }
            None => Some((start, end, vec![number])),
        };
    }

    if let Some(open) = window {
        previews.push(render(&lines, open));
    }
    previews
}

/// Previews of lines containing any of `terms`, ignoring case
pub fn preview_terms(text: &str, terms: &[String], before: usize, after: usize) -> Vec<TextPreview> {
    let terms: Vec<String> = terms
        .iter()
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect();
    if terms.is_empty() {
        return Vec::new();
    }

    filter_text_preview(
        text,
        |line| {
            let line = line.to_lowercase();
            terms.iter().any(|term| line.contains(term.as_str()))
        },
        before,
        after,
    )
}

fn render(lines: &[&str], (start, end, hits): (usize, usize, Vec<usize>)) -> TextPreview {
    TextPreview {
        offset: start,
        preview: lines[start..=end].join("\n"),
        hits,
    }
}
