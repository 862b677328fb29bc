//! Terminal colors for operator-facing output.

use crossterm::style::{Color, StyledContent, Stylize};

pub const PINK: Color = Color::AnsiValue(219);
pub const RED: Color = Color::AnsiValue(9);

pub const BANNER: &str = ". ݁₊ ⊹ . ݁ bunnyrs (\\_/) ⟡ ݁ . ⊹ ₊ ݁.";

pub fn pink(text: &str) -> StyledContent<&str> {
    text.with(PINK)
}

pub fn red(text: &str) -> StyledContent<&str> {
    text.with(RED)
}
