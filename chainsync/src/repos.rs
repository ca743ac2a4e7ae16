mod memory_repo;
#[cfg(feature = "postgres")]
mod postgres_repo;
mod repo;

pub use memory_repo::MemoryRepo;
#[cfg(feature = "postgres")]
pub use postgres_repo::{
    Conn as PostgresRepoConn, Pool as PostgresRepoPool, PostgresRepo, PostgresRepoRawQueryClient,
};
pub use repo::{
    BlockRef, Migratable, OutboxEntry, Repo, RepoError, RepoMigrations, SQLikeMigrations,
    SyncStatusWrite, TransactionRef,
};
