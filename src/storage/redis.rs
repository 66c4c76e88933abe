// src/storage/redis.rs

use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, Cmd, FromRedisValue, Pipeline, Script, Value};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::config::RedisConfig;
use crate::error::{RateLimiterError, Result, StorageError};
use crate::storage::{AtomicScript, StorageBackend, StoragePipeline};
use crate::storage_op;

/// Redis pipeline implementation.
///
/// Commands are collected and only assembled into a [`Pipeline`] on
/// execution, so an ASKING handle can put ASKING ahead of MULTI.
pub struct RedisPipeline {
    commands: Vec<Cmd>,
    atomic: bool,
}

impl RedisPipeline {
    /// Creates a new Redis pipeline
    fn new() -> Self {
        Self {
            commands: Vec::new(),
            atomic: false,
        }
    }

    fn build(self, asking: bool) -> Pipeline {
        let mut pipeline = Pipeline::new();
        if !asking {
            if self.atomic {
                pipeline.atomic();
            }
            for cmd in self.commands {
                pipeline.add_command(cmd);
            }
            return pipeline;
        }

        // ASKING stays in effect for a whole MULTI block
        pipeline.cmd("ASKING").ignore();
        if self.atomic {
            pipeline.cmd("MULTI").ignore();
            for cmd in self.commands {
                pipeline.add_command(cmd).ignore();
            }
            pipeline.cmd("EXEC");
        } else {
            for cmd in self.commands {
                pipeline.add_command(cmd);
            }
        }
        pipeline
    }
}

impl StoragePipeline for RedisPipeline {
    fn atomic(&mut self) -> &mut Self {
        self.atomic = true;
        self
    }

    fn delete(&mut self, keys: &[String]) -> &mut Self {
        self.commands.push(Cmd::del(keys));
        self
    }

    fn remove_members(&mut self, key: &str, members: &[String]) -> &mut Self {
        self.commands.push(Cmd::srem(key, members));
        self
    }
}

/// Redis-backed store handle.
///
/// The multiplexed [`ConnectionManager`] is cloned per call, so concurrent
/// callers pipeline over one connection without a client-side lock.
#[derive(Clone)]
pub struct RedisStorage {
    connection: ConnectionManager,
    config: RedisConfig,
    asking: bool,
}

// Manually implement Debug
impl fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStorage")
            .field("url", &self.config.url)
            .field("asking", &self.asking)
            .finish()
    }
}

impl RedisStorage {
    /// Creates a new Redis storage with the given configuration
    pub async fn new(config: RedisConfig) -> Result<Self> {
        // Open the client - this doesn't actually connect to Redis yet
        let client = Client::open(config.url.as_str())
            .map_err(|e| RateLimiterError::Storage(StorageError::RedisConnection(e.to_string())))?;

        // Create a connection manager with timeout
        let connection_future = ConnectionManager::new(client);

        // Apply the connection timeout using tokio::time::timeout
        let connection =
            match tokio::time::timeout(config.connection_timeout, connection_future).await {
                Ok(result) => {
                    // Connection attempt completed within timeout
                    result.map_err(|e| {
                        RateLimiterError::Storage(StorageError::RedisConnection(e.to_string()))
                    })?
                }
                Err(_) => {
                    // Connection attempt timed out
                    return Err(RateLimiterError::Storage(StorageError::RedisConnection(
                        format!(
                            "Connection to Redis at {} timed out after {:?}",
                            config.url, config.connection_timeout
                        ),
                    )));
                }
            };

        Ok(Self {
            connection,
            config,
            asking: false,
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.connection.clone()
    }

    /// Send one command, preceded by ASKING in the same write on an asking handle
    async fn query<T: FromRedisValue>(&self, cmd: Cmd) -> Result<T> {
        let mut conn = self.conn();
        if !self.asking {
            return Ok(cmd.query_async(&mut conn).await?);
        }
        let mut pipeline = Pipeline::new();
        pipeline.cmd("ASKING").ignore().add_command(cmd);
        let (reply,): (T,) = pipeline.query_async(&mut conn).await?;
        Ok(reply)
    }
}

#[async_trait]
impl StorageBackend for RedisStorage {
    type Pipeline = RedisPipeline;

    async fn ping(&self) -> Result<()> {
        let result: String = self.query(redis::cmd("PING")).await?;

        if result == "PONG" {
            Ok(())
        } else {
            Err(RateLimiterError::Storage(StorageError::RedisCommand(
                format!("Unexpected response from Redis PING: {}", result),
            )))
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.query(Cmd::get(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let cmd = match ttl {
            Some(ttl) => Cmd::pset_ex(key, value, ttl.as_millis() as u64),
            None => Cmd::set(key, value),
        };
        self.query(cmd).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.query(Cmd::exists(key)).await
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.query(Cmd::del(keys)).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.query(Cmd::hget(key, field)).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.query(Cmd::hgetall(key)).await
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        self.query(Cmd::zcard(key)).await
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        let mut cmd = redis::cmd("SCAN");
        cmd.arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count);
        self.query(cmd).await
    }

    async fn eval(
        &self,
        script: &AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> Result<Value> {
        let started = Instant::now();
        let result: Result<Value> = if self.asking {
            // ASKING only covers the next command, so skip the EVALSHA attempt
            let mut cmd = redis::cmd("EVAL");
            cmd.arg(script.lua).arg(keys.len()).arg(keys).arg(args);
            self.query(cmd).await
        } else {
            let lua = Script::new(script.lua);
            let mut invocation = lua.prepare_invoke();
            for key in keys {
                invocation.key(key);
            }
            for arg in args {
                invocation.arg(arg);
            }

            // EVALSHA, falling back to EVAL when the script is not cached yet
            invocation
                .invoke_async(&mut self.conn())
                .await
                .map_err(RateLimiterError::from)
        };
        storage_op!(
            script.name,
            keys.first().map(String::as_str).unwrap_or_default(),
            result,
            started.elapsed().as_millis() as u64
        );
        result
    }

    fn pipeline(&self) -> Self::Pipeline {
        RedisPipeline::new()
    }

    async fn execute_pipeline(&self, pipeline: Self::Pipeline) -> Result<Vec<Value>> {
        let mut conn = self.conn();
        if self.asking && pipeline.atomic {
            // the only reply kept is EXEC's array
            let (results,): (Vec<Value>,) =
                pipeline.build(true).query_async(&mut conn).await?;
            return Ok(results);
        }
        let results: Vec<Value> = pipeline.build(self.asking).query_async(&mut conn).await?;
        Ok(results)
    }

    fn asking(&self) -> Self {
        Self {
            asking: true,
            ..self.clone()
        }
    }
}
