//! Metadata handlers: parse, check and commit the YAML files of the landing zone.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dp_core::{
    from_yaml_str, MetadataEntity, Parameter, PipelineError, Site, Source, SourceType,
};
use dp_storage::{LandingZone, ZoneFileKind};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::db;

#[async_trait]
pub trait MetadataHandler: Send + Sync {
    fn kind(&self) -> ZoneFileKind;

    fn parse(&self, rel_path: &Path, text: &str) -> Result<MetadataEntity, PipelineError>;

    /// Semantic checks; references must already exist in the database.
    async fn check(
        &self,
        pool: &SqlitePool,
        rel_path: &Path,
        entity: &MetadataEntity,
    ) -> Result<Vec<PipelineError>>;

    async fn commit(
        &self,
        pool: &SqlitePool,
        zone: &LandingZone,
        rel_path: &Path,
        entity: &MetadataEntity,
    ) -> Result<()>;
}

fn owner_name_errors(rel_path: &Path, name: &str) -> Vec<PipelineError> {
    match LandingZone::metadata_owner_name(rel_path) {
        Some(owner) if owner != name => vec![PipelineError::consistency(format!(
            "{}: name {name} does not match folder {owner}",
            rel_path.display()
        ))],
        _ => Vec::new(),
    }
}

fn unexpected(entity: &MetadataEntity, handler: &str) -> anyhow::Error {
    anyhow::anyhow!("{handler} handler received a {} entity", entity.kind())
}

pub struct SiteHandler;

#[async_trait]
impl MetadataHandler for SiteHandler {
    fn kind(&self) -> ZoneFileKind {
        ZoneFileKind::SiteYaml
    }

    fn parse(&self, _rel_path: &Path, text: &str) -> Result<MetadataEntity, PipelineError> {
        from_yaml_str::<Site>(text).map(MetadataEntity::Site)
    }

    async fn check(
        &self,
        _pool: &SqlitePool,
        rel_path: &Path,
        entity: &MetadataEntity,
    ) -> Result<Vec<PipelineError>> {
        let MetadataEntity::Site(site) = entity else {
            return Err(unexpected(entity, "site"));
        };
        let mut errors = entity.validate();
        errors.extend(owner_name_errors(rel_path, &site.name));
        Ok(errors)
    }

    async fn commit(
        &self,
        pool: &SqlitePool,
        zone: &LandingZone,
        rel_path: &Path,
        entity: &MetadataEntity,
    ) -> Result<()> {
        let MetadataEntity::Site(site) = entity else {
            return Err(unexpected(entity, "site"));
        };
        let site_dir = rel_path.parent().unwrap_or(Path::new(""));
        let mut tx = pool.begin().await?;
        let site_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO site (name, description, street, postcode, city, coord_x, coord_y, coord_z)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (name) DO UPDATE SET
                description = excluded.description,
                street = excluded.street,
                postcode = excluded.postcode,
                city = excluded.city,
                coord_x = excluded.coord_x,
                coord_y = excluded.coord_y,
                coord_z = excluded.coord_z
            RETURNING site_id
            "#,
        )
        .bind(&site.name)
        .bind(&site.description)
        .bind(&site.street)
        .bind(&site.postcode)
        .bind(&site.city)
        .bind(site.coordinates.x)
        .bind(site.coordinates.y)
        .bind(site.coordinates.z)
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("saving site {}", site.name))?;

        sqlx::query("DELETE FROM picture WHERE site_id = ?")
            .bind(site_id)
            .execute(&mut *tx)
            .await?;
        for picture in &site.pictures {
            let image = zone.absolute(&site_dir.join(&picture.path));
            let data = match tokio::fs::read(&image).await {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    warn!(site = %site.name, path = %image.display(), %err, "picture not readable, storing without data");
                    None
                }
            };
            sqlx::query(
                "INSERT INTO picture (site_id, filename, description, date, data) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(site_id)
            .bind(&picture.path)
            .bind(&picture.description)
            .bind(&picture.date)
            .bind(data)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("saving picture {}", picture.path))?;
        }
        tx.commit().await?;
        Ok(())
    }
}

pub struct ParametersHandler;

#[async_trait]
impl MetadataHandler for ParametersHandler {
    fn kind(&self) -> ZoneFileKind {
        ZoneFileKind::ParametersYaml
    }

    fn parse(&self, _rel_path: &Path, text: &str) -> Result<MetadataEntity, PipelineError> {
        from_yaml_str::<Vec<Parameter>>(text).map(MetadataEntity::Parameters)
    }

    async fn check(
        &self,
        _pool: &SqlitePool,
        _rel_path: &Path,
        entity: &MetadataEntity,
    ) -> Result<Vec<PipelineError>> {
        Ok(entity.validate())
    }

    async fn commit(
        &self,
        pool: &SqlitePool,
        _zone: &LandingZone,
        _rel_path: &Path,
        entity: &MetadataEntity,
    ) -> Result<()> {
        let MetadataEntity::Parameters(parameters) = entity else {
            return Err(unexpected(entity, "parameters"));
        };
        let mut tx = pool.begin().await?;
        for parameter in parameters {
            sqlx::query(
                r#"
                INSERT INTO parameter (name, unit, description) VALUES (?, ?, ?)
                ON CONFLICT (name) DO UPDATE SET unit = excluded.unit, description = excluded.description
                "#,
            )
            .bind(&parameter.name)
            .bind(&parameter.unit)
            .bind(&parameter.description)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("saving parameter {}", parameter.name))?;
        }
        tx.commit().await?;
        Ok(())
    }
}

pub struct SourceTypeHandler;

#[async_trait]
impl MetadataHandler for SourceTypeHandler {
    fn kind(&self) -> ZoneFileKind {
        ZoneFileKind::SourceTypeYaml
    }

    fn parse(&self, _rel_path: &Path, text: &str) -> Result<MetadataEntity, PipelineError> {
        from_yaml_str::<SourceType>(text).map(MetadataEntity::SourceType)
    }

    async fn check(
        &self,
        _pool: &SqlitePool,
        rel_path: &Path,
        entity: &MetadataEntity,
    ) -> Result<Vec<PipelineError>> {
        let MetadataEntity::SourceType(source_type) = entity else {
            return Err(unexpected(entity, "source type"));
        };
        let mut errors = entity.validate();
        errors.extend(owner_name_errors(rel_path, &source_type.name));
        Ok(errors)
    }

    async fn commit(
        &self,
        pool: &SqlitePool,
        _zone: &LandingZone,
        _rel_path: &Path,
        entity: &MetadataEntity,
    ) -> Result<()> {
        let MetadataEntity::SourceType(source_type) = entity else {
            return Err(unexpected(entity, "source type"));
        };
        let mut tx = pool.begin().await?;
        let source_type_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO source_type (name, description) VALUES (?, ?)
            ON CONFLICT (name) DO UPDATE SET description = excluded.description
            RETURNING source_type_id
            "#,
        )
        .bind(&source_type.name)
        .bind(&source_type.description)
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("saving source type {}", source_type.name))?;

        sqlx::query("DELETE FROM special_value_definition WHERE source_type_id = ?")
            .bind(source_type_id)
            .execute(&mut *tx)
            .await?;
        for special in &source_type.special_values {
            sqlx::query(
                r#"
                INSERT INTO special_value_definition
                    (source_type_id, categorical_value, numerical_value, description)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(source_type_id)
            .bind(&special.categorical_value)
            .bind(special.numerical_value)
            .bind(&special.description)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

pub struct SourceHandler;

#[async_trait]
impl MetadataHandler for SourceHandler {
    fn kind(&self) -> ZoneFileKind {
        ZoneFileKind::SourceYaml
    }

    fn parse(&self, rel_path: &Path, text: &str) -> Result<MetadataEntity, PipelineError> {
        let mut source = from_yaml_str::<Source>(text)?;
        if source.source_type.is_none() {
            source.source_type = LandingZone::source_type_of_source(rel_path);
        }
        Ok(MetadataEntity::Source(source))
    }

    async fn check(
        &self,
        pool: &SqlitePool,
        rel_path: &Path,
        entity: &MetadataEntity,
    ) -> Result<Vec<PipelineError>> {
        let MetadataEntity::Source(source) = entity else {
            return Err(unexpected(entity, "source"));
        };
        let mut errors = entity.validate();
        errors.extend(owner_name_errors(rel_path, &source.name));

        let folder_type = LandingZone::source_type_of_source(rel_path);
        match (&source.source_type, &folder_type) {
            (Some(declared), Some(folder)) if declared != folder => {
                errors.push(PipelineError::consistency(format!(
                    "source {} declares source type {declared} but lives in folder {folder}",
                    source.name
                )));
            }
            (None, _) => errors.push(PipelineError::format(format!(
                "source {} has no source type",
                source.name
            ))),
            _ => {}
        }
        if let Some(source_type) = &source.source_type {
            if db::source_type_id(pool, source_type).await?.is_none() {
                errors.push(PipelineError::consistency(format!(
                    "source type {source_type} of source {} does not exist",
                    source.name
                )));
            }
        }
        if let Some(site) = &source.site {
            if db::site_id(pool, site).await?.is_none() {
                errors.push(PipelineError::consistency(format!(
                    "site {site} of source {} does not exist",
                    source.name
                )));
            }
        }
        for averaging in &source.averaging {
            if db::parameter_id(pool, &averaging.parameter).await?.is_none() {
                errors.push(PipelineError::consistency(format!(
                    "averaging of source {} refers to unknown parameter {}",
                    source.name, averaging.parameter
                )));
            }
        }
        Ok(errors)
    }

    async fn commit(
        &self,
        pool: &SqlitePool,
        _zone: &LandingZone,
        _rel_path: &Path,
        entity: &MetadataEntity,
    ) -> Result<()> {
        let MetadataEntity::Source(source) = entity else {
            return Err(unexpected(entity, "source"));
        };
        let source_type = source
            .source_type
            .as_deref()
            .with_context(|| format!("source {} has no source type", source.name))?;
        let mut tx = pool.begin().await?;
        let source_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO source (name, source_type_id, site_id, description, serial, manufacturer)
            VALUES (
                ?,
                (SELECT source_type_id FROM source_type WHERE name = ?),
                (SELECT site_id FROM site WHERE name = ?),
                ?, ?, ?
            )
            ON CONFLICT (name) DO UPDATE SET
                source_type_id = excluded.source_type_id,
                site_id = excluded.site_id,
                description = excluded.description,
                serial = excluded.serial,
                manufacturer = excluded.manufacturer
            RETURNING source_id
            "#,
        )
        .bind(&source.name)
        .bind(source_type)
        .bind(&source.site)
        .bind(&source.description)
        .bind(&source.serial)
        .bind(&source.manufacturer)
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("saving source {}", source.name))?;

        sqlx::query("DELETE FROM parameter_averaging WHERE source_id = ?")
            .bind(source_id)
            .execute(&mut *tx)
            .await?;
        for averaging in &source.averaging {
            sqlx::query(
                r#"
                INSERT INTO parameter_averaging
                    (source_id, parameter_id, integration_length_x, integration_length_y, comment)
                VALUES (?, (SELECT parameter_id FROM parameter WHERE name = ?), ?, ?, ?)
                "#,
            )
            .bind(source_id)
            .bind(&averaging.parameter)
            .bind(averaging.integration_length_x)
            .bind(averaging.integration_length_y)
            .bind(&averaging.comment)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("saving averaging of {} for {}", source.name, averaging.parameter))?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Handlers keyed by the landing-zone file kind they accept.
pub struct MetadataRegistry {
    handlers: Vec<Box<dyn MetadataHandler>>,
}

impl Default for MetadataRegistry {
    fn default() -> Self {
        Self {
            handlers: vec![
                Box::new(SiteHandler),
                Box::new(ParametersHandler),
                Box::new(SourceTypeHandler),
                Box::new(SourceHandler),
            ],
        }
    }
}

impl MetadataRegistry {
    pub fn handler_for(&self, rel_path: &Path) -> Option<&dyn MetadataHandler> {
        let kind = ZoneFileKind::classify(rel_path);
        self.handlers
            .iter()
            .find(|h| h.kind() == kind)
            .map(|h| h.as_ref())
    }

    /// Parse, check and commit one metadata file; returns the errors that stopped it.
    pub async fn handle(
        &self,
        pool: &SqlitePool,
        zone: &LandingZone,
        rel_path: &Path,
    ) -> Vec<PipelineError> {
        let Some(handler) = self.handler_for(rel_path) else {
            return vec![PipelineError::invalid_operation(format!(
                "no metadata handler for {}",
                rel_path.display()
            ))];
        };
        let text = match tokio::fs::read_to_string(zone.absolute(rel_path)).await {
            Ok(text) => text,
            Err(err) => {
                return vec![PipelineError::io(format!(
                    "cannot read {}: {err}",
                    rel_path.display()
                ))]
            }
        };
        let entity = match handler.parse(rel_path, &text) {
            Ok(entity) => entity,
            Err(err) => return vec![err],
        };
        match handler.check(pool, rel_path, &entity).await {
            Ok(errors) if !errors.is_empty() => return errors,
            Ok(_) => {}
            Err(err) => return vec![PipelineError::io(format!("{err:#}"))],
        }
        if let Err(err) = handler.commit(pool, zone, rel_path, &entity).await {
            return vec![PipelineError::io(format!("{err:#}"))];
        }
        info!(path = %rel_path.display(), kind = entity.kind(), "metadata committed");
        Vec::new()
    }
}
