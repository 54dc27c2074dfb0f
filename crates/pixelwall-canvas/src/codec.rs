//! Compact interchange encoding used when exporting a canvas.
//!
//! The encoding is a plain concatenation of one six-hex-digit token per cell in
//! row-major order. Empty cells are written as the background color.

use crate::error::CanvasError;

/// Width of one cell token.
pub const TOKEN_LEN: usize = 6;

/// Normalise `#rrggbb` / `rrggbb` to uppercase `RRGGBB`.
pub fn normalize_hex(color: &str) -> Option<String> {
    let digits = color.strip_prefix('#').unwrap_or(color);
    if digits.len() == TOKEN_LEN && digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(digits.to_ascii_uppercase())
    } else {
        None
    }
}

/// Encode a row-major sequence of cells.
pub fn encode_cells<'a, I>(cells: I, background: &str) -> Result<String, CanvasError>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let placeholder = normalize_hex(background)
        .ok_or_else(|| CanvasError::UnencodableColor(background.to_string()))?;

    let cells = cells.into_iter();
    let mut out = String::with_capacity(cells.size_hint().0 * TOKEN_LEN);
    for cell in cells {
        match cell {
            Some(color) => {
                let token = normalize_hex(color)
                    .ok_or_else(|| CanvasError::UnencodableColor(color.to_string()))?;
                out.push_str(&token);
            }
            None => out.push_str(&placeholder),
        }
    }
    Ok(out)
}
