// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::collections::BTreeMap;
use std::fmt;

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use wiregate_types::error::{ErrorBody, ErrorCode};

use crate::allocator::AllocError;
use crate::db::StoreError;
use crate::keys::KeyError;
use crate::middleware;
use crate::provision::ProvisionError;
use crate::validate::FieldErrors;

/// A failed request as the client sees it. Internal causes never leave the
/// process; they are logged under `reference` instead.
#[derive(Debug)]
pub struct ApiError {
    code: ErrorCode,
    message: String,
    reference: Option<String>,
    details: Option<BTreeMap<String, String>>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code.as_u32())
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            reference: None,
            details: None,
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(ErrorCode::Unauthorized, "unauthorized")
    }

    pub fn validation(errs: FieldErrors) -> Self {
        Self {
            details: Some(errs.into_map()),
            ..Self::new(ErrorCode::ValidationFailed, "validation failed")
        }
    }

    /// Logs `cause` and hides it behind the current request reference.
    pub fn internal(code: ErrorCode, cause: &dyn fmt::Display) -> Self {
        let reference = middleware::current_request_id();
        tracing::error!(code = code.as_u32(), %reference, error = %cause, "request failed");
        Self {
            reference: Some(reference),
            ..Self::new(code, "internal server error")
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    fn body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code.as_u32(),
            message: self.message.clone(),
            reference: self.reference.clone(),
            details: self.details.clone(),
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(self.body())
    }
}

fn alloc_code(err: &AllocError) -> Option<ErrorCode> {
    Some(match err {
        AllocError::OutOfRange(_) | AllocError::NoMatchingPool(_) => ErrorCode::IPOutOfRange,
        AllocError::NetworkAddress(_) => ErrorCode::IPIsNetworkAddress,
        AllocError::BroadcastAddress(_) => ErrorCode::IPIsBroadcastAddress,
        AllocError::ServerAddress(_) => ErrorCode::IPIsServerIP,
        AllocError::InUse(_) => ErrorCode::IPAlreadyInUse,
        AllocError::Exhausted(_) => ErrorCode::IPPoolExhausted,
        AllocError::PrefixTooSmall(_) => ErrorCode::WGPrefixTooSmall,
        AllocError::PoolDisabled => ErrorCode::IPPoolDisabled,
        AllocError::UnknownPool(_) => return None,
    })
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let code = match &err {
            StoreError::DuplicateUsername => ErrorCode::DuplicateUsername,
            StoreError::DuplicateEmail => ErrorCode::DuplicateEmail,
            StoreError::DuplicatePublicKey => ErrorCode::DuplicatePublicKey,
            StoreError::DuplicateDeviceName => ErrorCode::DuplicateDeviceName,
            StoreError::DuplicatePoolName => ErrorCode::DuplicatePoolName,
            StoreError::DuplicatePoolCidr => ErrorCode::DuplicatePoolCidr,
            StoreError::AddressInUse => ErrorCode::IPAlreadyInUse,
            StoreError::PoolInUse => ErrorCode::PoolInUse,
            StoreError::Database(_) | StoreError::KeyEncryption | StoreError::Corrupt(_) => {
                return Self::internal(ErrorCode::Persistence, &err);
            }
        };
        Self::new(code, err.to_string())
    }
}

impl From<ProvisionError> for ApiError {
    fn from(err: ProvisionError) -> Self {
        use ProvisionError as E;

        let err = match err {
            E::BatchItem { index, source } => {
                let mut inner = Self::from(*source);
                inner.message = format!("item {index}: {}", inner.message);
                return inner;
            }
            E::Validation(errs) => return Self::validation(errs),
            E::Store(store) => return Self::from(store),
            other => other,
        };

        let code = match &err {
            E::Forbidden => ErrorCode::PermissionDenied,
            E::Cancelled => ErrorCode::RequestCancelled,
            E::InvalidCredentials => ErrorCode::InvalidCredentials,
            E::UserNotFound => ErrorCode::UserNotFound,
            E::UserInactive => ErrorCode::UserInactive,
            E::PeerNotFound => ErrorCode::PeerNotFound,
            E::PeerDisabled => ErrorCode::PeerDisabled,
            E::PoolNotFound => ErrorCode::PoolNotFound,
            E::PoolInUse => ErrorCode::PoolInUse,
            E::ServerNotConfigured => ErrorCode::ServerNotConfigured,
            E::BatchTooLarge => ErrorCode::BatchTooLarge,
            E::EmptyBatch => ErrorCode::EmptyBatch,
            E::Alloc(alloc) => match alloc_code(alloc) {
                Some(code) => code,
                None => return Self::internal(ErrorCode::Internal, &err),
            },
            E::Key(KeyError::Rng(_)) => return Self::internal(ErrorCode::Internal, &err),
            E::Key(_) => ErrorCode::InvalidKey,
            E::Render(_) => return Self::internal(ErrorCode::FileSystem, &err),
            E::Apply(_) => return Self::internal(ErrorCode::WGApplyFailed, &err),
            E::Password(_) | E::Internal(_) => return Self::internal(ErrorCode::Internal, &err),
            E::BatchItem { .. } | E::Validation(_) | E::Store(_) => ErrorCode::Internal,
        };
        Self::new(code, err.to_string())
    }
}
