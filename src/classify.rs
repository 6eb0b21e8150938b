//! Static command classification.
//!
//! A pure lookup from case-folded verb to category. The table matches full
//! verbs only; suffix variants like `SORT` vs `SORT_RO` are distinct
//! entries, never substring matches. Unknown verbs fall back to `Write`,
//! the conservative choice: an unrecognized command is assumed to mutate
//! state and must never be served from a possibly-stale replica.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Read,
    Write,
    Admin,
    /// MULTI / EXEC / DISCARD / WATCH / UNWATCH. Interpreted by the session
    /// state machine rather than routed by category.
    TxControl,
    PubSub,
    Blocking,
    /// Scripts may read or write depending on the body, so they route as
    /// writes. The `_RO` variants are kept here too: a replica may not have
    /// the script loaded.
    Scripting,
}

#[derive(Debug, Clone, Copy)]
pub struct Classified {
    pub category: Category,
    /// False when the verb hit the conservative fallback; surfaced through
    /// stats so misclassification candidates are visible to operators.
    pub known: bool,
}

/// Classify an already upper-cased verb.
pub fn classify(verb: &str) -> Classified {
    use Category::*;

    let category = match verb {
        "MULTI" | "EXEC" | "DISCARD" | "WATCH" | "UNWATCH" => TxControl,

        "SUBSCRIBE" | "UNSUBSCRIBE" | "PSUBSCRIBE" | "PUNSUBSCRIBE" | "SSUBSCRIBE"
        | "SUNSUBSCRIBE" | "PUBLISH" | "SPUBLISH" | "PUBSUB" => PubSub,

        "BLPOP" | "BRPOP" | "BLMOVE" | "BRPOPLPUSH" | "BLMPOP" | "BZPOPMIN" | "BZPOPMAX"
        | "BZMPOP" | "WAIT" | "WAITAOF" => Blocking,
        // May carry BLOCK; treated as blocking either way so they hold a
        // dedicated master connection.
        "XREAD" | "XREADGROUP" => Blocking,

        "EVAL" | "EVALSHA" | "EVAL_RO" | "EVALSHA_RO" | "FCALL" | "FCALL_RO" | "SCRIPT"
        | "FUNCTION" => Scripting,

        "CONFIG" | "CLIENT" | "INFO" | "COMMAND" | "DEBUG" | "SLOWLOG" | "LATENCY" | "MEMORY"
        | "MONITOR" | "SHUTDOWN" | "REPLICAOF" | "SLAVEOF" | "FAILOVER" | "ACL" => Admin,

        // connection / health
        "PING" | "ECHO" |
        // keyspace iteration
        "SCAN" | "SSCAN" | "HSCAN" | "ZSCAN" | "KEYS" | "RANDOMKEY" | "DBSIZE" |
        // strings & bitmaps
        "GET" | "MGET" | "GETRANGE" | "SUBSTR" | "STRLEN" | "GETBIT" | "BITCOUNT" | "BITPOS" |
        "BITFIELD_RO" |
        // generic key inspection
        "EXISTS" | "TYPE" | "TTL" | "PTTL" | "EXPIRETIME" | "PEXPIRETIME" | "DUMP" | "OBJECT" |
        // hashes
        "HGET" | "HMGET" | "HGETALL" | "HEXISTS" | "HLEN" | "HSTRLEN" | "HKEYS" | "HVALS" |
        "HRANDFIELD" |
        // lists
        "LINDEX" | "LLEN" | "LRANGE" | "LPOS" |
        // sets
        "SCARD" | "SISMEMBER" | "SMISMEMBER" | "SMEMBERS" | "SRANDMEMBER" | "SINTER" |
        "SUNION" | "SDIFF" | "SINTERCARD" |
        // sorted sets
        "ZCARD" | "ZCOUNT" | "ZLEXCOUNT" | "ZRANGE" | "ZRANGEBYSCORE" | "ZRANGEBYLEX" |
        "ZREVRANGE" | "ZREVRANGEBYSCORE" | "ZREVRANGEBYLEX" | "ZRANK" | "ZREVRANK" | "ZSCORE" |
        "ZMSCORE" | "ZRANDMEMBER" | "ZDIFF" | "ZINTER" | "ZUNION" | "ZINTERCARD" |
        // streams
        "XLEN" | "XRANGE" | "XREVRANGE" |
        // geo
        "GEOPOS" | "GEODIST" | "GEOHASH" | "GEOSEARCH" |
        "SORT_RO" | "LOLWUT" | "TOUCH" => Read,

        // strings
        "SET" | "SETNX" | "SETEX" | "PSETEX" | "SETRANGE" | "APPEND" | "INCR" | "DECR"
        | "INCRBY" | "DECRBY" | "INCRBYFLOAT" | "GETSET" | "GETDEL" | "GETEX" | "MSET"
        | "MSETNX" |
        // generic
        "DEL" | "UNLINK" | "EXPIRE" | "PEXPIRE" | "EXPIREAT" | "PEXPIREAT" | "PERSIST"
        | "RENAME" | "RENAMENX" | "MOVE" | "COPY" | "RESTORE" | "SORT" |
        // lists
        "LPUSH" | "RPUSH" | "LPUSHX" | "RPUSHX" | "LPOP" | "RPOP" | "LSET" | "LINSERT"
        | "LREM" | "LTRIM" | "RPOPLPUSH" | "LMOVE" | "LMPOP" |
        // sets
        "SADD" | "SREM" | "SPOP" | "SMOVE" | "SINTERSTORE" | "SUNIONSTORE" | "SDIFFSTORE" |
        // hashes
        "HSET" | "HSETNX" | "HMSET" | "HDEL" | "HINCRBY" | "HINCRBYFLOAT" |
        // sorted sets
        "ZADD" | "ZINCRBY" | "ZREM" | "ZPOPMIN" | "ZPOPMAX" | "ZMPOP" | "ZREMRANGEBYRANK"
        | "ZREMRANGEBYSCORE" | "ZREMRANGEBYLEX" | "ZRANGESTORE" | "ZDIFFSTORE"
        | "ZINTERSTORE" | "ZUNIONSTORE" |
        // streams
        "XADD" | "XDEL" | "XTRIM" | "XSETID" | "XACK" | "XCLAIM" | "XAUTOCLAIM" | "XGROUP" |
        // bitmaps / hll / geo
        "SETBIT" | "BITOP" | "BITFIELD" | "PFADD" | "PFMERGE" | "PFCOUNT" | "GEOADD"
        | "GEOSEARCHSTORE" |
        // db-wide
        "FLUSHDB" | "FLUSHALL" | "SWAPDB" => Write,

        _ => return Classified { category: Write, known: false },
    };

    Classified {
        category,
        known: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_and_writes() {
        assert_eq!(classify("GET").category, Category::Read);
        assert_eq!(classify("MGET").category, Category::Read);
        assert_eq!(classify("SET").category, Category::Write);
        // read-write hybrids are writes
        assert_eq!(classify("GETSET").category, Category::Write);
        assert_eq!(classify("COPY").category, Category::Write);
    }

    #[test]
    fn sort_and_sort_ro_are_distinct() {
        assert_eq!(classify("SORT").category, Category::Write);
        assert_eq!(classify("SORT_RO").category, Category::Read);
    }

    #[test]
    fn unknown_defaults_to_write() {
        let c = classify("FROBNICATE");
        assert_eq!(c.category, Category::Write);
        assert!(!c.known);
        assert!(classify("GET").known);
    }

    #[test]
    fn control_categories() {
        assert_eq!(classify("MULTI").category, Category::TxControl);
        assert_eq!(classify("EXEC").category, Category::TxControl);
        assert_eq!(classify("SUBSCRIBE").category, Category::PubSub);
        assert_eq!(classify("PUBLISH").category, Category::PubSub);
        assert_eq!(classify("BLPOP").category, Category::Blocking);
        assert_eq!(classify("WAIT").category, Category::Blocking);
        assert_eq!(classify("EVALSHA").category, Category::Scripting);
        assert_eq!(classify("CONFIG").category, Category::Admin);
    }
}
