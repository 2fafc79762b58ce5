//! Test doubles.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use amgrid_core::{
    AllocateRequest, AllocateResponse, Container, ContainerId, ContainerStatus, Resource,
};
use async_trait::async_trait;

use crate::client::ResourceManagerClient;

/// A resource manager that replays scripted responses and records every request.
///
/// Once the script runs out it answers with empty responses. Response ids
/// are always the request's id plus one.
#[derive(Default)]
pub(crate) struct MockResourceManager {
    requests: Mutex<Vec<AllocateRequest>>,
    script: Mutex<VecDeque<anyhow::Result<AllocateResponse>>>,
}

impl MockResourceManager {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn respond(&self, granted: Vec<Container>, completed: Vec<ContainerStatus>) {
        self.script.lock().unwrap().push_back(Ok(AllocateResponse {
            response_id: 0,
            granted,
            completed,
        }));
    }

    pub(crate) fn fail(&self, message: &'static str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(anyhow::anyhow!(message)));
    }

    pub(crate) fn requests(&self) -> Vec<AllocateRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn last_request(&self) -> AllocateRequest {
        self.requests
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no request recorded")
    }
}

#[async_trait]
impl ResourceManagerClient for MockResourceManager {
    async fn allocate(&self, request: AllocateRequest) -> anyhow::Result<AllocateResponse> {
        let next_id = request.response_id + 1;
        self.requests.lock().unwrap().push(request);
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(response)) => Ok(AllocateResponse {
                response_id: next_id,
                ..response
            }),
            Some(Err(e)) => Err(e),
            None => Ok(AllocateResponse {
                response_id: next_id,
                ..AllocateResponse::default()
            }),
        }
    }
}

pub(crate) fn grant(id: &str, host: &str, priority: i32) -> Container {
    Container {
        id: ContainerId::from(id),
        host: host.to_string(),
        priority,
        resource: Resource {
            memory_mb: 64,
            vcores: 1,
        },
    }
}

pub(crate) fn finished(id: &str) -> ContainerStatus {
    ContainerStatus {
        id: ContainerId::from(id),
        exit_status: 0,
        diagnostics: String::new(),
    }
}
