use thiserror::Error;

use stockroom_core::types::{Category, CategoryPatch, NewCategory};
use stockroom_storage::{CategoryError as CategoryStorageError, Database, ProductError};

/// Orchestrates category reads and writes, including the empty-categories
/// view and the restrict-on-delete policy.
#[derive(Clone)]
pub struct CategoryService {
    database: Database,
}

impl CategoryService {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    /// Persists a new category. Names are not required to be unique.
    pub async fn create(&self, input: NewCategory) -> Result<Category, CategoryServiceError> {
        let category = self.database.categories().insert(&input).await?;
        Ok(category)
    }

    pub async fn find_all(&self) -> Result<Vec<Category>, CategoryServiceError> {
        Ok(self.database.categories().list().await?)
    }

    /// Categories with zero referencing products.
    pub async fn find_empty(&self) -> Result<Vec<Category>, CategoryServiceError> {
        Ok(self.database.categories().list_empty().await?)
    }

    pub async fn find_one(&self, id: i64) -> Result<Category, CategoryServiceError> {
        self.database
            .categories()
            .fetch(id)
            .await?
            .ok_or(CategoryServiceError::NotFound(id))
    }

    /// Merges provided fields into the existing record; omitted fields keep
    /// their current value.
    pub async fn update(
        &self,
        id: i64,
        patch: CategoryPatch,
    ) -> Result<Category, CategoryServiceError> {
        let mut category = self.find_one(id).await?;
        if let Some(name) = patch.name {
            category.name = name;
        }
        if let Some(description) = patch.description {
            category.description = Some(description);
        }

        let affected = self.database.categories().update(&category).await?;
        if affected == 0 {
            return Err(CategoryServiceError::NotFound(id));
        }
        Ok(category)
    }

    /// Deletes a category. Deletion is refused while products still reference
    /// it so stock rows and their audit history cannot be orphaned.
    pub async fn remove(&self, id: i64) -> Result<(), CategoryServiceError> {
        let referencing = self.database.products().count_for_category(id).await?;
        if referencing > 0 {
            return Err(CategoryServiceError::InUse(id));
        }

        let affected = self
            .database
            .categories()
            .delete(id)
            .await
            .map_err(|err| match err {
                CategoryStorageError::InUse => CategoryServiceError::InUse(id),
                other => CategoryServiceError::Storage(other),
            })?;
        if affected == 0 {
            return Err(CategoryServiceError::NotFound(id));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum CategoryServiceError {
    #[error("Category with ID {0} not found")]
    NotFound(i64),
    #[error("Category with ID {0} still has associated products")]
    InUse(i64),
    #[error("category error: {0}")]
    Storage(#[from] CategoryStorageError),
    #[error("product error: {0}")]
    Products(#[from] ProductError),
}
