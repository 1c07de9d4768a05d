mod http_test;
mod store_test;
