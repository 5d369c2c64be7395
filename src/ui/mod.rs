pub mod icons;
pub mod output;
pub mod table;
pub mod theme;

pub use icons::Icons;
pub use output::{dim, header, human_bytes, info, section, success, summary_row, warn};
pub use table::{descriptor_table, DescriptorRow};
pub use theme::{theme, Theme};
