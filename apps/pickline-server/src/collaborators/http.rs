use async_trait::async_trait;
use pickline_core::{Order, OrderId, SessionId};
use reqwest::{header, Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{
    CollaboratorError, OrderRepository, PackagingSuggestions, PackedOrderRecord, PersistOutcome,
    PhotoUpload, PhotoUploadService, SuggestionService,
};

const ORDER_SERVICE: &str = "order repository";
const SUGGESTION_SERVICE: &str = "suggestion service";
const PHOTO_SERVICE: &str = "photo upload service";

fn trimmed(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

async fn decode<T>(service: &'static str, res: Response) -> Result<T, CollaboratorError>
where
    T: DeserializeOwned,
{
    let res = ensure_success(service, res).await?;
    res.json::<T>()
        .await
        .map_err(|source| CollaboratorError::Http { service, source })
}

async fn ensure_success(service: &'static str, res: Response) -> Result<Response, CollaboratorError> {
    if res.status().is_success() {
        Ok(res)
    } else {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        Err(CollaboratorError::UnexpectedStatus {
            service,
            status,
            body,
        })
    }
}

#[derive(Serialize)]
struct OrderBatch<'a> {
    session_id: SessionId,
    order_ids: &'a [OrderId],
}

pub struct HttpOrderRepository {
    http: Client,
    base_url: String,
}

impl HttpOrderRepository {
    pub fn new(http: Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: trimmed(base_url),
        }
    }
}

#[async_trait]
impl OrderRepository for HttpOrderRepository {
    async fn lock_orders_for_session(
        &self,
        session_id: SessionId,
        order_ids: &[OrderId],
    ) -> Result<Vec<Order>, CollaboratorError> {
        let res = self
            .http
            .post(format!("{}/orders/lock", self.base_url))
            .json(&OrderBatch {
                session_id,
                order_ids,
            })
            .send()
            .await
            .map_err(|source| CollaboratorError::Http {
                service: ORDER_SERVICE,
                source,
            })?;
        decode(ORDER_SERVICE, res).await
    }

    async fn release_orders(
        &self,
        session_id: SessionId,
        order_ids: &[OrderId],
    ) -> Result<(), CollaboratorError> {
        let res = self
            .http
            .post(format!("{}/orders/release", self.base_url))
            .json(&OrderBatch {
                session_id,
                order_ids,
            })
            .send()
            .await
            .map_err(|source| CollaboratorError::Http {
                service: ORDER_SERVICE,
                source,
            })?;
        ensure_success(ORDER_SERVICE, res).await.map(|_| ())
    }

    async fn persist_packed_order(
        &self,
        record: PackedOrderRecord,
    ) -> Result<PersistOutcome, CollaboratorError> {
        let res = self
            .http
            .post(format!("{}/orders/{}/packed", self.base_url, record.order_id))
            .json(&record)
            .send()
            .await
            .map_err(|source| CollaboratorError::Http {
                service: ORDER_SERVICE,
                source,
            })?;
        decode(ORDER_SERVICE, res).await
    }
}

pub struct HttpSuggestionService {
    http: Client,
    base_url: String,
}

impl HttpSuggestionService {
    pub fn new(http: Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: trimmed(base_url),
        }
    }
}

#[async_trait]
impl SuggestionService for HttpSuggestionService {
    async fn suggest(&self, order_id: OrderId) -> Result<PackagingSuggestions, CollaboratorError> {
        let res = self
            .http
            .get(format!(
                "{}/orders/{}/packaging-suggestions",
                self.base_url, order_id
            ))
            .send()
            .await
            .map_err(|source| CollaboratorError::Http {
                service: SUGGESTION_SERVICE,
                source,
            })?;
        decode(SUGGESTION_SERVICE, res).await
    }
}

#[derive(Deserialize)]
struct UploadResponse {
    photo_url: String,
}

pub struct HttpPhotoUploadService {
    http: Client,
    base_url: String,
}

impl HttpPhotoUploadService {
    pub fn new(http: Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: trimmed(base_url),
        }
    }
}

#[async_trait]
impl PhotoUploadService for HttpPhotoUploadService {
    async fn upload(&self, upload: PhotoUpload) -> Result<String, CollaboratorError> {
        let content_type = upload
            .content_type
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let order_id = upload.order_id.to_string();
        let res = self
            .http
            .post(format!("{}/photos", self.base_url))
            .query(&[
                ("session_token", upload.session_token.as_str()),
                ("order_id", order_id.as_str()),
            ])
            .header(header::CONTENT_TYPE, content_type)
            .body(upload.bytes)
            .send()
            .await
            .map_err(|source| CollaboratorError::Http {
                service: PHOTO_SERVICE,
                source,
            })?;
        let body: UploadResponse = decode(PHOTO_SERVICE, res).await?;
        Ok(body.photo_url)
    }
}
