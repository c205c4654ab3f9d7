// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One-shot introspection requests against a Master.
//!
//! Listing requests need no client registration, so the tool never shows
//! up in the lists it prints.

use rendez::master::protocol::{read_frame, write_frame};
use rendez::master::{
    ClientFrame, MasterRequest, MasterResponse, ServerFrame, ServiceSummary, TopicSummary,
};
use rendez::{NodeInfo, Status};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Blocking connection used for listing requests.
pub struct MasterQuery {
    stream: TcpStream,
    next_id: u64,
}

impl MasterQuery {
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, Status> {
        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| Status::unavailable(format!("cannot reach master {}: {}", addr, e)))?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        Ok(Self { stream, next_id: 1 })
    }

    fn request(&mut self, request: MasterRequest) -> Result<MasterResponse, Status> {
        let id = self.next_id;
        self.next_id += 1;
        write_frame(&mut self.stream, &ClientFrame { id, request }, MAX_MESSAGE_SIZE)?;
        loop {
            match read_frame::<_, ServerFrame>(&mut self.stream, MAX_MESSAGE_SIZE)? {
                Some(ServerFrame::Response { id: got, response }) if got == id => {
                    return match response {
                        MasterResponse::Error { status } => Err(status),
                        other => Ok(other),
                    };
                }
                Some(_) => continue,
                None => return Err(Status::unavailable("master closed the connection")),
            }
        }
    }

    pub fn nodes(&mut self) -> Result<Vec<NodeInfo>, Status> {
        match self.request(MasterRequest::ListNodes)? {
            MasterResponse::Nodes { nodes } => Ok(nodes),
            other => Err(unexpected(&other)),
        }
    }

    pub fn topics(&mut self) -> Result<Vec<TopicSummary>, Status> {
        match self.request(MasterRequest::ListTopics)? {
            MasterResponse::Topics { topics } => Ok(topics),
            other => Err(unexpected(&other)),
        }
    }

    pub fn services(&mut self) -> Result<Vec<ServiceSummary>, Status> {
        match self.request(MasterRequest::ListServices)? {
            MasterResponse::Services { services } => Ok(services),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &MasterResponse) -> Status {
    Status::internal(format!("unexpected response {:?}", response))
}
