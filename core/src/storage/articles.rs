//! Article store: CRUD plus a tag side table.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::db::Database;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    pub title: String,
    pub authors: Vec<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub year: Option<i64>,
    pub source_url: Option<String>,
    pub arxiv_id: Option<String>,
    pub s2_id: Option<String>,
    pub pdf_path: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub tags: Vec<String>,
}

pub struct ArticleStore<'a> {
    db: &'a Database,
}

fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

impl<'a> ArticleStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        ArticleStore { db }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        title: &str,
        authors: &[String],
        abstract_text: Option<&str>,
        year: Option<i64>,
        source_url: Option<&str>,
        arxiv_id: Option<&str>,
        s2_id: Option<&str>,
    ) -> Result<i64> {
        let authors_json = serde_json::to_string(authors)?;
        let now = now_iso();
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO articles (title, authors, abstract_text, year, source_url, arxiv_id, s2_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![title, authors_json, abstract_text, year, source_url, arxiv_id, s2_id, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get(&self, id: i64) -> Result<Option<Article>> {
        let conn = self.db.lock();
        let article = conn
            .query_row(
                "SELECT id, title, authors, abstract_text, year, source_url, arxiv_id, s2_id, pdf_path, created_at, updated_at
                 FROM articles WHERE id = ?1",
                params![id],
                row_to_article,
            )
            .optional()?;
        let Some(mut article) = article else { return Ok(None) };
        article.tags = self.tags_for(&conn, id)?;
        Ok(Some(article))
    }

    pub fn list(&self, tag: Option<&str>) -> Result<Vec<Article>> {
        let conn = self.db.lock();
        let mut articles = if let Some(tag) = tag {
            let mut stmt = conn.prepare(
                "SELECT a.id, a.title, a.authors, a.abstract_text, a.year, a.source_url, a.arxiv_id, a.s2_id, a.pdf_path, a.created_at, a.updated_at
                 FROM articles a JOIN article_tags t ON t.article_id = a.id
                 WHERE t.tag = ?1
                 ORDER BY a.created_at DESC",
            )?;
            stmt.query_map(params![tag], row_to_article)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            let mut stmt = conn.prepare(
                "SELECT id, title, authors, abstract_text, year, source_url, arxiv_id, s2_id, pdf_path, created_at, updated_at
                 FROM articles ORDER BY created_at DESC",
            )?;
            stmt.query_map([], row_to_article)?.collect::<rusqlite::Result<Vec<_>>>()?
        };
        for article in &mut articles {
            article.tags = self.tags_for(&conn, article.id)?;
        }
        Ok(articles)
    }

    pub fn update(
        &self,
        id: i64,
        title: Option<&str>,
        authors: Option<&[String]>,
        abstract_text: Option<Option<&str>>,
    ) -> Result<bool> {
        let conn = self.db.lock();
        let mut sets = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(t) = title {
            sets.push("title = ?");
            values.push(Box::new(t.to_string()));
        }
        if let Some(a) = authors {
            sets.push("authors = ?");
            values.push(Box::new(serde_json::to_string(a)?));
        }
        if let Some(ab) = abstract_text {
            sets.push("abstract_text = ?");
            values.push(Box::new(ab.map(|s| s.to_string())));
        }
        if sets.is_empty() {
            let exists: bool = conn
                .query_row("SELECT 1 FROM articles WHERE id = ?1", params![id], |_| Ok(true))
                .optional()?
                .unwrap_or(false);
            return Ok(exists);
        }
        sets.push("updated_at = ?");
        values.push(Box::new(now_iso()));
        let sql = format!("UPDATE articles SET {} WHERE id = ?", sets.join(", "));
        values.push(Box::new(id));
        let params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let affected = conn.execute(&sql, params.as_slice())?;
        Ok(affected > 0)
    }

    pub fn delete(&self, id: i64) -> Result<bool> {
        let conn = self.db.lock();
        let affected = conn.execute("DELETE FROM articles WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    pub fn add_tag(&self, article_id: i64, tag: &str) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT OR IGNORE INTO article_tags (article_id, tag) VALUES (?1, ?2)",
            params![article_id, tag],
        )?;
        Ok(())
    }

    pub fn remove_tag(&self, article_id: i64, tag: &str) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "DELETE FROM article_tags WHERE article_id = ?1 AND tag = ?2",
            params![article_id, tag],
        )?;
        Ok(())
    }

    pub fn list_tags(&self) -> Result<Vec<String>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT tag FROM article_tags ORDER BY tag")?;
        let tags = stmt.query_map([], |row| row.get(0))?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tags)
    }

    fn tags_for(&self, conn: &rusqlite::Connection, article_id: i64) -> Result<Vec<String>> {
        let mut stmt = conn.prepare("SELECT tag FROM article_tags WHERE article_id = ?1 ORDER BY tag")?;
        let tags = stmt
            .query_map(params![article_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tags)
    }
}

fn row_to_article(row: &rusqlite::Row) -> rusqlite::Result<Article> {
    let authors_json: String = row.get(2)?;
    let authors: Vec<String> = serde_json::from_str(&authors_json).unwrap_or_default();
    Ok(Article {
        id: row.get(0)?,
        title: row.get(1)?,
        authors,
        abstract_text: row.get(3)?,
        year: row.get(4)?,
        source_url: row.get(5)?,
        arxiv_id: row.get(6)?,
        s2_id: row.get(7)?,
        pdf_path: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        tags: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_tag_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let store = ArticleStore::new(&db);
        let authors = vec!["Ada Lovelace".to_string()];
        let id = store.create("On Computation", &authors, None, Some(1843), None, None, None).unwrap();
        store.add_tag(id, "history").unwrap();
        store.add_tag(id, "math").unwrap();

        let article = store.get(id).unwrap().unwrap();
        assert_eq!(article.authors, authors);
        assert_eq!(article.tags, vec!["history".to_string(), "math".to_string()]);

        let by_tag = store.list(Some("math")).unwrap();
        assert_eq!(by_tag.len(), 1);

        store.remove_tag(id, "math").unwrap();
        assert_eq!(store.list_tags().unwrap(), vec!["history".to_string()]);
    }
}
