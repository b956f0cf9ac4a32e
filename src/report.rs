use crate::models::EditTable;
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use csv::Writer;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Namespace labels for report columns, displayed in ascending namespace ID order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceCatalog {
    labels: BTreeMap<i32, String>,
}

impl NamespaceCatalog {
    pub fn new(labels: BTreeMap<i32, String>) -> Self {
        Self { labels }
    }

    /// Namespaces of the Chinese Minecraft Wiki (zh.minecraft.wiki).
    pub fn minecraft_wiki_zh() -> Self {
        let labels = [
            (0, "（主）"),
            (1, "讨论"),
            (2, "用户"),
            (3, "用户讨论"),
            (4, "Minecraft Wiki"),
            (5, "Minecraft Wiki讨论"),
            (6, "文件"),
            (7, "文件讨论"),
            (8, "MediaWiki"),
            (9, "MediaWiki讨论"),
            (10, "模板"),
            (11, "模板讨论"),
            (12, "帮助"),
            (13, "帮助讨论"),
            (14, "分类"),
            (15, "分类讨论"),
            (828, "模块"),
            (829, "模块讨论"),
            (2300, "Gadget"),
            (2301, "Gadget talk"),
            (2302, "Gadget definition"),
            (2303, "Gadget definition talk"),
            (9996, "地下城教程"),
            (9997, "地下城教程讨论"),
            (9998, "教程"),
            (9999, "教程讨论"),
            (10000, "地下城"),
            (10001, "地下城讨论"),
            (10002, "地球"),
            (10003, "地球讨论"),
            (10004, "故事模式"),
            (10005, "故事模式讨论"),
            (10006, "传奇"),
            (10007, "传奇讨论"),
        ];
        Self::new(
            labels
                .into_iter()
                .map(|(id, label)| (id, label.to_string()))
                .collect(),
        )
    }

    pub fn label(&self, namespace: i32) -> Option<&str> {
        self.labels.get(&namespace).map(String::as_str)
    }

    /// Namespace IDs in column order.
    pub fn order(&self) -> impl Iterator<Item = i32> + '_ {
        self.labels.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

pub fn default_report_name(now: DateTime<Local>) -> String {
    format!("editcount-{}.csv", now.format("%Y%m%d-%H%M%S"))
}

/// Writes one row per user: username, total, then one count per catalog
/// namespace. Edits in namespaces outside the catalog only show in the total.
/// Rows are ordered by descending total, then username.
pub fn write_report<W: Write>(
    table: &EditTable,
    catalog: &NamespaceCatalog,
    out: W,
) -> Result<()> {
    let mut writer = Writer::from_writer(out);

    let mut header = vec!["Username".to_string(), "Total".to_string()];
    header.extend(catalog.labels.values().cloned());
    writer.write_record(&header)?;

    let mut rows: Vec<_> = table.iter().collect();
    rows.sort_by(|(a_user, a), (b_user, b)| b.total.cmp(&a.total).then_with(|| a_user.cmp(b_user)));

    for (user, count) in rows {
        let mut record = Vec::with_capacity(catalog.len() + 2);
        record.push(user.clone());
        record.push(count.total.to_string());
        record.extend(catalog.order().map(|ns| count.namespace(ns).to_string()));
        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(())
}

pub fn write_report_file(table: &EditTable, catalog: &NamespaceCatalog, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("Failed to create report file: {:?}", path))?;
    write_report(table, catalog, BufWriter::with_capacity(128 * 1024, file))
        .with_context(|| format!("Failed to write report: {:?}", path))?;
    info!(path = ?path, users = table.len(), "Report written");
    Ok(())
}
