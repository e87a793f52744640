use anyhow::Context;
use async_trait::async_trait;
use disttable::{
    CollectionRef,
    DocumentStore,
};
use mongodb::{
    bson::{
        self,
        Document,
    },
    Client,
    Collection,
};
use serde_json::Value as JsonValue;

use crate::dataset::JsonObject;

/// FerretDB seen through the MongoDB wire protocol.
pub struct MongoDocumentStore {
    client: Client,
}

impl MongoDocumentStore {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = Client::with_uri_str(url)
            .await
            .context("fail to connect to the document store")?;
        Ok(Self { client })
    }

    fn collection(&self, collection: &CollectionRef) -> Collection<Document> {
        self.client
            .database(&collection.database)
            .collection(&collection.collection)
    }

    pub async fn insert_many(
        &self,
        collection: &CollectionRef,
        documents: &[Document],
    ) -> anyhow::Result<()> {
        self.collection(collection).insert_many(documents).await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    async fn insert_one(
        &self,
        collection: &CollectionRef,
        document: JsonValue,
    ) -> anyhow::Result<()> {
        let document = bson::to_document(&document)?;
        self.collection(collection).insert_one(document).await?;
        Ok(())
    }

    async fn delete_one(
        &self,
        collection: &CollectionRef,
        filter: JsonValue,
    ) -> anyhow::Result<u64> {
        let filter = bson::to_document(&filter)?;
        let result = self.collection(collection).delete_one(filter).await?;
        Ok(result.deleted_count)
    }

    async fn drop_collection(&self, collection: &CollectionRef) -> anyhow::Result<()> {
        self.collection(collection).drop().await?;
        Ok(())
    }
}

pub fn to_documents(records: &[JsonObject]) -> anyhow::Result<Vec<Document>> {
    records
        .iter()
        .enumerate()
        .map(|(i, record)| {
            bson::to_document(record).with_context(|| format!("record {i} is not a document"))
        })
        .collect()
}
