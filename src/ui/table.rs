use crate::descriptor::Descriptor;
use crate::ui::human_bytes;
use crate::Result;
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
pub struct DescriptorRow {
    #[tabled(rename = "Id")]
    pub id: String,
    #[tabled(rename = "Owner")]
    pub owner: String,
    #[tabled(rename = "Size")]
    pub size: String,
    #[tabled(rename = "Created")]
    pub created: String,
    #[tabled(rename = "Last Modified")]
    pub last_modified: String,
}

impl DescriptorRow {
    pub fn from_descriptor(descriptor: &Descriptor) -> Result<Self> {
        Ok(Self {
            id: descriptor.id()?.to_string(),
            owner: descriptor.owner()?.to_string(),
            size: human_bytes(descriptor.len()?),
            created: descriptor.created()?.format("%Y-%m-%d %H:%M:%S").to_string(),
            last_modified: descriptor.last_modified()?.format("%Y-%m-%d %H:%M:%S").to_string(),
        })
    }
}

pub fn descriptor_table(rows: &[DescriptorRow]) -> String {
    if rows.is_empty() {
        return String::new();
    }
    Table::new(rows).with(Style::rounded()).to_string()
}
