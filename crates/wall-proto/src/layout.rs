//! Layout controller: maps a layout selection to how many channels are
//! visible and where each visible tile sits on screen.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LayoutMode {
    #[serde(rename = "1x1")]
    Single,
    #[default]
    #[serde(rename = "2x2")]
    Grid2x2,
    #[serde(rename = "3x3")]
    Grid3x3,
    #[serde(rename = "4x4")]
    Grid4x4,
}

impl LayoutMode {
    pub fn columns(self) -> u32 {
        match self {
            LayoutMode::Single => 1,
            LayoutMode::Grid2x2 => 2,
            LayoutMode::Grid3x3 => 3,
            LayoutMode::Grid4x4 => 4,
        }
    }

    pub fn visible_count(self) -> usize {
        (self.columns() * self.columns()) as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LayoutMode::Single => "1x1",
            LayoutMode::Grid2x2 => "2x2",
            LayoutMode::Grid3x3 => "3x3",
            LayoutMode::Grid4x4 => "4x4",
        }
    }

    /// Screen rectangle of the tile at `index` (registry order), or `None`
    /// when the layout has no room for it.
    pub fn tile(self, index: usize, screen: Screen) -> Option<Tile> {
        if index >= self.visible_count() {
            return None;
        }
        let cols = self.columns();
        let width = screen.width / cols;
        let height = screen.height / cols;
        let col = index as u32 % cols;
        let row = index as u32 / cols;
        Some(Tile {
            x: col * width,
            y: row * height,
            width,
            height,
        })
    }
}

impl fmt::Display for LayoutMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LayoutMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1x1" | "single" => Ok(LayoutMode::Single),
            "2x2" => Ok(LayoutMode::Grid2x2),
            "3x3" => Ok(LayoutMode::Grid3x3),
            "4x4" => Ok(LayoutMode::Grid4x4),
            other => anyhow::bail!("unknown layout '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Screen {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tile {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Tile {
    /// X11-style geometry string, `WxH+X+Y`.
    pub fn geometry(&self) -> String {
        format!("{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}
