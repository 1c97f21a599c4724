pub mod http_stream;
