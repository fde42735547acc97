pub mod seqbuf;

pub use seqbuf::SeqBuf;
